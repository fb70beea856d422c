//! # Clock Out
//!
//! Drive MIDI clock on a virtual output for a few bars, with a note on every
//! beat. Connect the "midi out 0" port to a synth or a clock follower.
//!
//! **Concepts:** Manual ports, clock modes, transport, shared tempo
//!
//! ```bash
//! cargo run --example clock_out
//! ```

use std::time::{Duration, Instant};
use seqbus::prelude::*;

const PPQN: u32 = 192;
const BPM: f64 = 120.0;

fn main() -> seqbus::Result<()> {
    tracing_subscriber::fmt().init();

    let mut session = MidiSession::builder()
        .client_name("seqbus-clock")
        .manual_ports(0, 1)
        .tempo(PPQN, BPM)
        .clock(ClockMode::Pos)
        .build()?;

    for port in session.enumerate_ports(PortDirection::Output) {
        println!("Sending clock on {port}");
    }

    let pulse = Duration::from_secs_f64(60.0 / (BPM * PPQN as f64));
    let bars = 4;
    let end = u64::from(PPQN) * 4 * bars;

    session.init_clock(0);
    let started = Instant::now();
    let mut tick = 0;
    let mut last_beat = None;
    while tick < end {
        tick = (started.elapsed().as_secs_f64() / pulse.as_secs_f64()) as u64;
        session.clock(tick);
        let beat = tick / u64::from(PPQN);
        if last_beat != Some(beat) {
            session.send(0, &Message::note_on(9, 42, 100))?;
            last_beat = Some(beat);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    session.transport(Transport::Stop);
    println!("Stopped after {bars} bars.");

    Ok(())
}
