use crate::core::{HarnessError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Line-protocol client for the lab RF attenuator: `SET <db>` / `GET`
/// requests, `OK [<db>]` / `ERR <msg>` replies.
pub struct Attenuator {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    io_timeout: Duration,
}

impl Attenuator {
    pub async fn connect(addr: &str, io_timeout: Duration) -> Result<Self> {
        let stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| HarnessError::Timeout(io_timeout.as_secs()))??;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            io_timeout,
        })
    }

    async fn roundtrip(&mut self, line: &str) -> Result<String> {
        let deadline = self.io_timeout;
        let msg = format!("{line}\n");
        timeout(deadline, self.writer.write_all(msg.as_bytes()))
            .await
            .map_err(|_| HarnessError::Timeout(deadline.as_secs()))??;
        let mut reply = String::new();
        let n = timeout(deadline, self.reader.read_line(&mut reply))
            .await
            .map_err(|_| HarnessError::Timeout(deadline.as_secs()))??;
        if n == 0 {
            return Err(HarnessError::Attenuator("connection closed".to_string()));
        }
        let reply = reply.trim().to_string();
        if let Some(msg) = reply.strip_prefix("ERR") {
            return Err(HarnessError::Attenuator(msg.trim().to_string()));
        }
        Ok(reply)
    }

    pub async fn set_level(&mut self, db: u32) -> Result<()> {
        let reply = self.roundtrip(&format!("SET {db}")).await?;
        if reply.starts_with("OK") {
            Ok(())
        } else {
            Err(HarnessError::Attenuator(format!("unexpected reply: {reply}")))
        }
    }

    pub async fn level(&mut self) -> Result<u32> {
        let reply = self.roundtrip("GET").await?;
        parse_level_reply(&reply)
    }

}

/// Inclusive level sequence for a ramp, in either direction. The final
/// endpoint is always included even when the step overshoots it.
pub fn levels(from: u32, to: u32, step: u32) -> Vec<u32> {
    let step = step.max(1);
    let mut out = Vec::new();
    if from <= to {
        let mut v = from;
        while v <= to {
            out.push(v);
            v += step;
        }
    } else {
        let mut v = from;
        loop {
            out.push(v);
            if v < to + step {
                break;
            }
            v -= step;
        }
    }
    if out.last() != Some(&to) {
        out.push(to);
    }
    out
}

fn parse_level_reply(reply: &str) -> Result<u32> {
    let rest = reply
        .strip_prefix("OK")
        .ok_or_else(|| HarnessError::Attenuator(format!("unexpected reply: {reply}")))?;
    rest.trim()
        .parse()
        .map_err(|_| HarnessError::Attenuator(format!("bad level in reply: {reply}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn ascending_ramp_includes_endpoints() {
        assert_eq!(levels(0, 30, 10), vec![0, 10, 20, 30]);
        assert_eq!(levels(0, 25, 10), vec![0, 10, 20, 25]);
        assert_eq!(levels(5, 5, 10), vec![5]);
    }

    #[test]
    fn descending_ramp_includes_endpoints() {
        assert_eq!(levels(30, 0, 10), vec![30, 20, 10, 0]);
        assert_eq!(levels(25, 0, 10), vec![25, 15, 5, 0]);
    }

    #[test]
    fn level_reply_parsing() {
        assert_eq!(parse_level_reply("OK 12").unwrap(), 12);
        assert!(parse_level_reply("OK").is_err());
        assert!(parse_level_reply("BUSY").is_err());
    }

    #[tokio::test]
    async fn talks_to_a_line_protocol_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = tokio::io::BufReader::new(reader).lines();
            let mut level = 0u32;
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = if let Some(db) = line.strip_prefix("SET ") {
                    level = db.trim().parse().unwrap();
                    "OK".to_string()
                } else if line == "GET" {
                    format!("OK {level}")
                } else {
                    "ERR unknown command".to_string()
                };
                writer.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
            }
        });

        let mut atten = Attenuator::connect(&addr, Duration::from_secs(2)).await.unwrap();
        atten.set_level(17).await.unwrap();
        assert_eq!(atten.level().await.unwrap(), 17);
        let err = atten.roundtrip("NOPE").await.unwrap_err();
        assert!(matches!(err, HarnessError::Attenuator(_)));
    }
}
