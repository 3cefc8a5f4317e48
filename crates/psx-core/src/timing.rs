//! Video timing: scanline batches and the frame blank.
//!
//! Scanlines advance in batches of [`SCANLINE_BATCH`]. Each batch deadline is
//! a running sum of batch costs (the ideal deadline), not the cycle the
//! previous batch happened to fire at, so block overshoot never accumulates.

pub const CPU_CLOCK_HZ: u64 = 33_868_800;
pub const CYCLES_PER_SCANLINE: u64 = 2152;
pub const SCANLINES_PER_FRAME: u32 = 263;
pub const SCANLINE_BATCH: u32 = 32;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    #[default]
    Ntsc,
    Pal,
}

impl Region {
    pub fn refresh_hz(self) -> u64 {
        match self {
            Region::Ntsc => 60,
            Region::Pal => 50,
        }
    }

    /// Cycles between frame blanks.
    pub fn frame_cycles(self) -> u64 {
        CPU_CLOCK_HZ / self.refresh_hz()
    }
}

impl std::str::FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ntsc" => Ok(Region::Ntsc),
            "pal" => Ok(Region::Pal),
            other => Err(format!("unknown region '{other}'")),
        }
    }
}

/// Result of one scanline batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// The batch completed the last scanline of the frame.
    pub frame_end: bool,
    /// When the next batch is due.
    pub next_deadline: u64,
}

#[derive(Debug, Clone)]
pub struct VideoTiming {
    region: Region,
    scanline: u32,
    ideal: u64,
    frames: u64,
}

impl VideoTiming {
    pub fn new(region: Region) -> Self {
        Self {
            region,
            scanline: 0,
            ideal: 0,
            frames: 0,
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn scanline(&self) -> u32 {
        self.scanline
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Deadline of the next scanline batch.
    pub fn ideal_deadline(&self) -> u64 {
        self.ideal
    }

    fn batch_from(scanline: u32) -> u32 {
        (SCANLINES_PER_FRAME - scanline).min(SCANLINE_BATCH)
    }

    /// Restart at scanline 0; returns the first batch deadline.
    pub fn start(&mut self, now: u64) -> u64 {
        self.scanline = 0;
        self.ideal = now + u64::from(SCANLINE_BATCH) * CYCLES_PER_SCANLINE;
        self.ideal
    }

    pub fn frame_blank_deadline(&self, now: u64) -> u64 {
        now + self.region.frame_cycles()
    }

    /// Account for the batch that just fired at cycle `now`.
    pub fn advance_batch(&mut self, now: u64) -> BatchOutcome {
        self.scanline += Self::batch_from(self.scanline);
        let frame_end = self.scanline >= SCANLINES_PER_FRAME;
        if frame_end {
            self.scanline = 0;
            self.frames += 1;
        }

        let next = Self::batch_from(self.scanline);
        self.ideal += u64::from(next) * CYCLES_PER_SCANLINE;
        if self.ideal <= now {
            self.ideal = now + 1;
        }
        BatchOutcome {
            frame_end,
            next_deadline: self.ideal,
        }
    }
}
