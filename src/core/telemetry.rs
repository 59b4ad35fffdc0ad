use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init(level: &str, json: bool, no_ansi: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let base = fmt::layer().with_target(true).with_ansi(!no_ansi);
    let layer = if json { base.json().boxed() } else { base.boxed() };
    let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
}
