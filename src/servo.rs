//! PI servo used to discipline non-LRC clocks from clock-feed differences.

use log::debug;

pub struct PiServo {
    kp: f64,
    ki: f64,
    integral: f64,
    max_integral: f64,
    max_adj_ppm: f64,
}

impl PiServo {
    pub fn new(kp: f64, ki: f64) -> Self {
        PiServo {
            kp,
            ki,
            integral: 0.0,
            // 200 PPM is a safe upper bound for standard crystal drift.
            // Allowing more just invites instability (windup).
            max_integral: 200.0,
            max_adj_ppm: 500.0,
        }
    }

    pub fn set_gains(&mut self, kp: Option<f64>, ki: Option<f64>) {
        if let Some(kp) = kp {
            self.kp = kp;
        }
        if let Some(ki) = ki {
            self.ki = ki;
        }
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
    }

    /// Calculate frequency adjustment (in PPM) to correct the phase offset
    /// (in nanoseconds). `offset_ns`: local − reference, positive if the
    /// local clock is ahead.
    pub fn sample(&mut self, offset_ns: i64) -> f64 {
        // Drive offset_ns to 0: ahead needs a negative adjustment, behind a
        // positive one.
        let error = -(offset_ns as f64) / 1000.0; // µs

        self.integral += error * self.ki;
        self.integral = self.integral.clamp(-self.max_integral, self.max_integral);

        let proportional = error * self.kp;
        let adjustment_ppm = proportional + self.integral;
        let final_adj = adjustment_ppm.clamp(-self.max_adj_ppm, self.max_adj_ppm);

        debug!(
            "servo: err={}ns P={:.3} I={:.3} adj={:.3}ppm",
            offset_ns, proportional, self.integral, final_adj
        );

        final_adj
    }
}
