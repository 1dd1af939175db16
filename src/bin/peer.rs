//! Reference peer — the minimal external-collaborator client.
//!
//! This binary exists only to exercise the broker's wire contract (§6) in
//! integration tests. It does not implement the GUI, the transport-
//! encryption collaborator, or real flag-file creation on disk — those
//! remain out of scope per the broker specification's explicit Non-goals.
//! It answers the setup handshake with a synthetic random path and always
//! acknowledges the flag-write command without actually running a shell,
//! and otherwise prints whatever the broker sends.

use anyhow::{Context, Result};
use clap::Parser;
use ctf_broker::{Frame, FrameDecoder, SegmentType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(name = "ctf-peer")]
#[command(version)]
#[command(about = "Reference peer for the CTF broker's wire contract")]
struct Cli {
    /// Broker host.
    host: String,
    /// Broker port.
    port: u16,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let _stop_rx = ctf_broker::lifecycle::install()?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(&cli.host, cli.port))?;
    std::process::exit(ctf_broker::lifecycle::exit_code());
}

async fn run(host: &str, port: u16) -> Result<()> {
    let stream = TcpStream::connect((host, port)).await.with_context(|| format!("connect to {host}:{port}"))?;
    let (mut read_half, mut write_half) = stream.into_split();

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; ctf_broker::constants::FRAME_BUFFER];
    let mut flag_dir_reported = false;

    loop {
        let n = read_half.read(&mut buf).await.context("read from broker")?;
        if n == 0 {
            log::info!("broker closed the connection");
            break;
        }

        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("malformed frame from broker: {e}");
                decoder.recover();
                continue;
            }
        };

        for frame in frames {
            for segment in frame.segments {
                match segment.ty {
                    SegmentType::Out | SegmentType::Err => {
                        print!("{}", String::from_utf8_lossy(&segment.data));
                    }
                    SegmentType::Cwd => {
                        log::debug!("cwd update: {}", String::from_utf8_lossy(&segment.data));
                    }
                    SegmentType::Cmd => {
                        log::debug!("command from opponent: {}", String::from_utf8_lossy(&segment.data));
                    }
                    SegmentType::Key => {}
                    SegmentType::Flg => {
                        let body = String::from_utf8_lossy(&segment.data);
                        let reply = if body == "FLG_DIR" {
                            flag_dir_reported = true;
                            ctf_broker::policy::random_path(16)
                        } else if flag_dir_reported {
                            "okay".to_string()
                        } else {
                            continue;
                        };
                        let out = Frame::single(SegmentType::Flg, reply).encode();
                        write_half.write_all(&out).await.context("reply to broker")?;
                    }
                }
            }
        }
    }

    Ok(())
}
