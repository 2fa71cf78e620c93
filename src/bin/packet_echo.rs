//! Minimal TCP echo target for exercising the shaping transmitter by hand:
//! accepts one connection at a time and logs the size and arrival time of
//! every chunk it receives, so fragmentation and delay jitter are visible
//! from the receiving end. Grounded in
//! `original_source/tools/packet_inspector.py`.

use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "packet-echo")]
#[command(about = "Logs the size and timing of every chunk received on a TCP port")]
struct Args {
    /// Port to listen on
    #[arg(default_value = "9000")]
    port: u16,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let args = Args::parse();
    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    println!("packet-echo listening on port {}", args.port);
    println!("point the proxy's upstream at http://localhost:{}/", args.port);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        println!("\n[+] connection from {peer}");

        let started = tokio::time::Instant::now();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    println!("error: {e}");
                    break;
                }
            };
            println!(
                " -> {} bytes at +{:?}",
                n,
                started.elapsed()
            );
        }
        println!("[-] connection closed");
    }
}
