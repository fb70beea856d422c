//! Tempo, PPQN and song-position arithmetic shared by every backend.

pub const DEFAULT_PPQN: u32 = 192;
pub const DEFAULT_BPM: f64 = 120.0;

/// MIDI clock runs at 24 ticks per quarter note.
pub const CLOCKS_PER_QUARTER: u32 = 24;

/// Song position is counted in sixteenth notes.
pub const SIXTEENTHS_PER_QUARTER: u32 = 4;

/// Length, in sixteenths, of the clock-alignment modulus (16 bars of 4/4).
pub const CLOCK_MODULUS: u32 = 16 * 4;

const MIN_BPM: f64 = 0.009_999_9;

/// Microseconds per quarter note; 0 for a stopped or invalid tempo.
#[inline]
pub fn tempo_us_from_bpm(bpm: f64) -> u32 {
    if bpm.is_finite() && bpm > MIN_BPM {
        (60_000_000.0 / bpm) as u32
    } else {
        0
    }
}

#[inline]
pub fn bpm_from_tempo_us(tempo_us: u32) -> f64 {
    if tempo_us == 0 {
        0.0
    } else {
        60_000_000.0 / tempo_us as f64
    }
}

/// Pulses between two MIDI clock ticks, at least 1.
#[inline]
pub fn clock_ticks_from_ppqn(ppqn: u32) -> u32 {
    (ppqn / CLOCKS_PER_QUARTER).max(1)
}

#[inline]
pub fn pulses_per_sixteenth(ppqn: u32) -> u32 {
    (ppqn / SIXTEENTHS_PER_QUARTER).max(1)
}

/// Song-position value (sixteenths) for a pulse position.
#[inline]
pub fn song_position_beats(tick: u64, ppqn: u32) -> u32 {
    (tick / pulses_per_sixteenth(ppqn) as u64).min(u32::MAX as u64) as u32
}

/// Pulses in one clock-alignment modulus.
#[inline]
pub fn clock_mod_ticks(ppqn: u32) -> u64 {
    pulses_per_sixteenth(ppqn) as u64 * CLOCK_MODULUS as u64
}

/// Audio frames from the start of the song to `tick`, for frame-located transports.
pub fn pulse_to_frames(tick: u64, ppqn: u32, bpm: f64, sample_rate: u32) -> u64 {
    if ppqn == 0 || !(bpm.is_finite() && bpm > 0.0) {
        return 0;
    }
    let seconds = tick as f64 * 60.0 / (bpm * ppqn as f64);
    (seconds * sample_rate as f64).round() as u64
}

/// Pulses elapsed over `frames` samples; the inverse of [`pulse_to_frames`].
pub fn frames_to_pulses(frames: u64, ppqn: u32, bpm: f64, sample_rate: u32) -> u64 {
    if sample_rate == 0 || !(bpm.is_finite() && bpm > 0.0) {
        return 0;
    }
    let pulses = frames as f64 * bpm * ppqn as f64 / (60.0 * sample_rate as f64);
    pulses.floor() as u64
}
