//! # List Ports
//!
//! Open the first usable backend, list what it sees, then watch for ports
//! coming and going.
//!
//! **Concepts:** Backend selection, port catalogs, rescans
//!
//! ```bash
//! cargo run --example list_ports
//! cargo run --example list_ports --features alsa
//! ```

use std::time::Duration;
use seqbus::prelude::*;

fn main() -> seqbus::Result<()> {
    tracing_subscriber::fmt().init();

    let mut session = MidiSession::builder().client_name("seqbus-list").build()?;
    println!("Backend: {}\n", session.api());
    print!("{}", session.port_list());

    println!("\nBuses:");
    for direction in [PortDirection::Input, PortDirection::Output] {
        for port in session.enumerate_ports(direction) {
            println!("  {direction:>6} {port}");
        }
    }

    println!("\nWatching for port changes for 10 seconds...");
    for _ in 0..100 {
        if session.ports_changed() {
            let total = session.rescan()?;
            println!("Ports changed, {total} ports now");
            print!("{}", session.port_list());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    Ok(())
}
