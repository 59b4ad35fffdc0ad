mod client;
mod device;

pub use client::AdbClient;
pub use device::{Device, DeviceManager};
