//! riptide server binary.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser;

use http1::HttpServer;
use protocol_framed::{FrameMode, FrameServer};
use reactor::{EventLoopThread, listen_addr};
use server::banner::{BannerConfig, print_banner};
use server::config::{Config, FramedMode};
use server::{logging, signal};

#[derive(Parser)]
#[command(name = "riptide-server")]
#[command(about = "Event-driven HTTP and framed-message server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("no config file specified; use <config path> or --print-config");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config) {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&config.logging);

    let http_addr = listen_addr(
        config.server.port,
        config.server.loopback_only,
        config.server.ipv6,
    );

    let main_loop = EventLoopThread::start("riptide-main")?;

    let http = HttpServer::new(main_loop.handle(), http_addr)?;
    http.set_io_loop_num(config.server.io_loops);
    http.set_keep_alive_timeout(config.http.keep_alive_timeout);
    http.set_max_keep_alive_requests(config.http.max_keep_alive_requests);
    for mount in &config.mounts {
        if !http.add_mount_point(&mount.prefix, &mount.dir, Vec::new()) {
            return Err(format!("bad mount point: {} -> {}", mount.prefix, mount.dir).into());
        }
    }

    let framed = match &config.framed {
        Some(framed_config) => {
            let addr = listen_addr(
                framed_config.port,
                config.server.loopback_only,
                config.server.ipv6,
            );
            let mode = match framed_config.mode {
                FramedMode::Structured => FrameMode::Structured,
                FramedMode::Opaque => FrameMode::Opaque,
            };
            let frame_server = FrameServer::new(main_loop.handle(), addr, mode)?;
            frame_server.set_io_loop_num(config.server.io_loops);
            frame_server.set_ping_pong(framed_config.ping_interval, framed_config.ping_timeout);
            match mode {
                FrameMode::Structured => {
                    frame_server.register_structured_handler(1, |conn, value| {
                        FrameServer::send_json(
                            conn,
                            &serde_json::json!({ "type": 2, "echo": value.get("data") }),
                        );
                    });
                }
                FrameMode::Opaque => {
                    frame_server.register_opaque_handler(1, |conn, body| {
                        FrameServer::send_opaque(conn, 2, body);
                    });
                }
            }
            Some(frame_server)
        }
        None => None,
    };

    let mounts: Vec<(String, String)> = config
        .mounts
        .iter()
        .map(|m| (m.prefix.clone(), m.dir.clone()))
        .collect();
    print_banner(&BannerConfig {
        version: env!("CARGO_PKG_VERSION"),
        http_addr: http.addr(),
        framed_addr: framed.as_ref().map(|f| f.addr()),
        io_loops: config.server.io_loops,
        mounts: &mounts,
    });

    http.start()?;
    if let Some(framed) = &framed {
        framed.start()?;
    }

    let shutdown = signal::install_signal_handler();
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::info!("stopping listeners");
    if let Some(framed) = &framed {
        framed.stop();
    }
    http.stop();
    Ok(())
}

fn print_default_config() {
    let config = r#"# riptide server configuration

[server]
# Listen port for the HTTP listener
port = 8080

# Bind loopback only (127.0.0.1 / ::1)
loopback_only = false

# Bind an IPv6 address instead of IPv4
ipv6 = false

# Listener socket options
reuse_addr = true
reuse_port = false

# Number of I/O loop threads; 0 serves connections on the main loop
io_loops = 3

[http]
# Idle seconds before a keep-alive connection is closed
keep_alive_timeout = 60

# Requests served per connection before it is closed
max_keep_alive_requests = 10

# Static-file mounts; repeat the block for more
# [[mount]]
# prefix = "/"
# dir = "/var/www"

# Optional framed-message listener with ping/pong liveness
# [framed]
# port = 8888
# mode = "structured"      # or "opaque"
# ping_interval = 10
# ping_timeout = 3

[logging]
# Level filter when RUST_LOG is not set
level = "info"

# "pretty", "compact", or "json"
format = "pretty"
timestamps = true
"#;
    print!("{config}");
}
