//! Weight Sensor Bus
//!
//! The load cell sits behind a clocked two-line interface (data + clock).
//! Each conversion yields a 24-bit signed two's-complement word, shifted out
//! MSB first, followed by 1-3 extra clock pulses that select channel and gain
//! for the *next* conversion.
//!
//! ```text
//!   DOUT ‾‾‾\____[b23][b22] ... [b0]________________
//!   SCK  ________/\_/\_ ... _/\_/\__/\______________
//!                 24 data pulses   gain pulses (1 = A/128)
//! ```
//!
//! Two implementations of [`WeightBus`] live here:
//! - [`Hx711`]: bit-banged protocol over any `embedded-hal` pin pair
//! - [`SimulatedBus`]: a software load cell for machines without the hardware

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use thiserror::Error;

/// Bus communication failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The converter never signalled data-ready.
    #[error("sensor not ready after {polls} polls")]
    NotReady {
        /// Number of readiness polls made.
        polls: u32,
    },

    /// A pin operation failed.
    #[error("pin error: {0}")]
    Pin(String),

    /// A transient glitch on the line (corrupted or missing word).
    #[error("bus glitch: {0}")]
    Glitch(String),

    /// The bus was used after its resources were released.
    #[error("bus released")]
    Released,
}

/// A source of raw conversion words.
///
/// Calls block for the duration of a single bus transaction. The driver is
/// responsible for serializing access; implementations need not be reentrant.
pub trait WeightBus: Send {
    /// Read one raw conversion word (sign-extended to `i32`).
    fn read_raw(&mut self) -> Result<i32, BusError>;

    /// Power-cycle the converter back to a known state.
    fn reset(&mut self) -> Result<(), BusError>;

    /// Release pins and other OS resources. Must tolerate repeated calls.
    fn release(&mut self) -> Result<(), BusError>;
}

// =============================================================================
// HX711 PROTOCOL
// =============================================================================

/// Channel/gain selection, encoded as the number of trailing clock pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gain {
    /// Channel A, gain 128.
    A128 = 1,
    /// Channel B, gain 32.
    B32 = 2,
    /// Channel A, gain 64.
    A64 = 3,
}

/// Bits per conversion word.
pub const WORD_BITS: u32 = 24;

/// Sign-extend a 24-bit two's-complement word.
#[inline]
pub fn sign_extend_24(word: u32) -> i32 {
    let word = word & 0x00FF_FFFF;
    if word & 0x0080_0000 != 0 {
        (word | 0xFF00_0000) as i32
    } else {
        word as i32
    }
}

fn pin_error(err: impl std::fmt::Debug) -> BusError {
    BusError::Pin(format!("{err:?}"))
}

/// HX711 load-cell amplifier on a data input, a clock output and a delay
/// source.
pub struct Hx711<D, C, T> {
    data: D,
    clock: C,
    delay: T,
    gain: Gain,
    /// Readiness polls before giving up on a conversion.
    ready_polls: u32,
    /// Delay between readiness polls, in microseconds.
    poll_interval_us: u32,
    released: bool,
}

impl<D, C, T> Hx711<D, C, T>
where
    D: InputPin,
    C: OutputPin,
    T: DelayNs,
{
    /// Wrap the two lines at channel A / gain 128.
    pub fn new(data: D, clock: C, delay: T) -> Self {
        Self {
            data,
            clock,
            delay,
            gain: Gain::A128,
            ready_polls: 100,
            poll_interval_us: 1_000,
            released: false,
        }
    }

    /// Select a different channel/gain.
    pub fn with_gain(mut self, gain: Gain) -> Self {
        self.gain = gain;
        self
    }

    /// Tune readiness polling.
    pub fn with_ready_polling(mut self, polls: u32, interval: Duration) -> Self {
        self.ready_polls = polls.max(1);
        self.poll_interval_us = u32::try_from(interval.as_micros()).unwrap_or(u32::MAX);
        self
    }

    /// Currently selected gain.
    pub fn gain(&self) -> Gain {
        self.gain
    }

    /// Give the lines and delay source back.
    pub fn into_parts(self) -> (D, C, T) {
        (self.data, self.clock, self.delay)
    }

    fn wait_ready(&mut self) -> Result<(), BusError> {
        for poll in 0..self.ready_polls {
            // DOUT low means a conversion is waiting.
            if self.data.is_low().map_err(pin_error)? {
                return Ok(());
            }
            if poll + 1 < self.ready_polls && self.poll_interval_us > 0 {
                self.delay.delay_us(self.poll_interval_us);
            }
        }
        Err(BusError::NotReady { polls: self.ready_polls })
    }

    /// One clock pulse. No delay while the clock is high: a sleep can
    /// overshoot the 60us power-down threshold.
    fn pulse(&mut self) -> Result<(), BusError> {
        self.clock.set_high().map_err(pin_error)?;
        self.clock.set_low().map_err(pin_error)
    }
}

impl<D, C, T> WeightBus for Hx711<D, C, T>
where
    D: InputPin + Send,
    C: OutputPin + Send,
    T: DelayNs + Send,
{
    fn read_raw(&mut self) -> Result<i32, BusError> {
        if self.released {
            return Err(BusError::Released);
        }
        self.wait_ready()?;

        let mut word: u32 = 0;
        for _ in 0..WORD_BITS {
            self.pulse()?;
            let bit = self.data.is_high().map_err(pin_error)?;
            word = (word << 1) | u32::from(bit);
        }
        for _ in 0..self.gain as u8 {
            self.pulse()?;
        }

        Ok(sign_extend_24(word))
    }

    fn reset(&mut self) -> Result<(), BusError> {
        if self.released {
            return Err(BusError::Released);
        }
        // Clock held high for >60us powers the converter down.
        self.clock.set_high().map_err(pin_error)?;
        self.delay.delay_us(100);
        self.clock.set_low().map_err(pin_error)?;
        // The first conversion after power-up uses the default gain; clock
        // it out so the configured gain takes effect.
        self.read_raw().map(|_| ())
    }

    fn release(&mut self) -> Result<(), BusError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        // Leave the converter powered down; the lines go back to the OS
        // when the pins are dropped.
        self.clock.set_high().map_err(pin_error)
    }
}

// =============================================================================
// SIMULATED LOAD CELL
// =============================================================================

/// Deterministic noise source (Xorshift128+ seeded through SplitMix64).
#[derive(Debug, Clone)]
struct Noise {
    state: [u64; 2],
}

impl Noise {
    fn new(seed: u64) -> Self {
        let mut s = seed;
        let a = splitmix64(&mut s);
        let b = splitmix64(&mut s);
        let state = if a == 0 && b == 0 { [1, 1] } else { [a, b] };
        Self { state }
    }

    fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Uniform integer in `[-amplitude, amplitude]`.
    fn jitter(&mut self, amplitude: u32) -> i32 {
        if amplitude == 0 {
            return 0;
        }
        let span = u64::from(amplitude) * 2 + 1;
        (self.next_u64() % span) as i32 - amplitude as i32
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[derive(Debug)]
struct SimState {
    /// Raw counts with nothing on the platform.
    baseline: i32,
    /// Raw counts per physical weight unit.
    counts_per_unit: f64,
    /// Current load in weight units.
    load: f64,
    /// Peak raw-count noise.
    noise_amplitude: u32,
    noise: Noise,
    /// Number of upcoming reads that fail with a glitch.
    pending_faults: u32,
    /// Raw value returned (once) instead of the real conversion.
    pending_spikes: Vec<i32>,
    resets: u32,
    released: bool,
}

/// Software load cell.
///
/// Cloning yields another handle to the same cell, so a test (or a demo
/// console) can change the load while the driver owns the bus.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new(8_388, 420.0, 3)
    }
}

impl SimulatedBus {
    /// Create a cell with the given zero-load counts, sensitivity and noise.
    pub fn new(baseline: i32, counts_per_unit: f64, noise_amplitude: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                baseline,
                counts_per_unit,
                load: 0.0,
                noise_amplitude,
                noise: Noise::new(0x5EED_CE11),
                pending_faults: 0,
                pending_spikes: Vec::new(),
                resets: 0,
                released: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Place a load (in weight units) on the platform.
    pub fn set_load(&self, load: f64) {
        self.lock().load = load;
    }

    /// Make the next `n` reads fail with a glitch.
    pub fn fail_next(&self, n: u32) {
        self.lock().pending_faults = n;
    }

    /// Queue raw values to be returned before real conversions resume.
    pub fn inject_raw(&self, values: &[i32]) {
        self.lock().pending_spikes.extend_from_slice(values);
    }

    /// Number of times the converter was reset.
    pub fn reset_count(&self) -> u32 {
        self.lock().resets
    }

    /// Whether `release` has been called.
    pub fn is_released(&self) -> bool {
        self.lock().released
    }
}

impl WeightBus for SimulatedBus {
    fn read_raw(&mut self) -> Result<i32, BusError> {
        let mut s = self.lock();
        if s.released {
            return Err(BusError::Released);
        }
        if s.pending_faults > 0 {
            s.pending_faults -= 1;
            return Err(BusError::Glitch("simulated line fault".to_string()));
        }
        if !s.pending_spikes.is_empty() {
            return Ok(s.pending_spikes.remove(0));
        }

        let amplitude = s.noise_amplitude;
        let jitter = s.noise.jitter(amplitude);
        let signal = (s.load * s.counts_per_unit).round() as i32;
        Ok(sign_extend_24((s.baseline.wrapping_add(signal).wrapping_add(jitter)) as u32))
    }

    fn reset(&mut self) -> Result<(), BusError> {
        let mut s = self.lock();
        if s.released {
            return Err(BusError::Released);
        }
        s.resets += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<(), BusError> {
        self.lock().released = true;
        Ok(())
    }
}
