//! Startup banner.

use std::net::SocketAddr;

pub struct BannerConfig<'a> {
    pub version: &'a str,
    pub http_addr: SocketAddr,
    pub framed_addr: Option<SocketAddr>,
    pub io_loops: usize,
    pub mounts: &'a [(String, String)],
}

pub fn print_banner(config: &BannerConfig<'_>) {
    println!("riptide {}", config.version);
    println!("  http listener   : {}", config.http_addr);
    match config.framed_addr {
        Some(addr) => println!("  framed listener : {addr}"),
        None => println!("  framed listener : disabled"),
    }
    println!("  i/o loops       : {}", config.io_loops);
    for (prefix, dir) in config.mounts {
        println!("  mount           : {prefix} -> {dir}");
    }
}
