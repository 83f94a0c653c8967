//! Command-line interface definitions.
//!
//! Argument surface only; all playback logic lives in the engine crate.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "snapstream", about = "Clock-synchronized stream playback client")]
pub struct Args {
    /// Server to connect to. Falls back to the last-used server.
    pub host: Option<String>,

    /// Server stream port
    #[arg(long, default_value_t = 1704)]
    pub port: u16,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Client name reported to the server
    #[arg(long, default_value = "snapstream")]
    pub name: String,

    /// Extra playback latency in milliseconds (-2000..2000)
    #[arg(long, default_value_t = 0)]
    pub latency: i32,

    /// Do not reconnect automatically after connection loss
    #[arg(long)]
    pub no_reconnect: bool,
}
