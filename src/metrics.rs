pub struct ThroughputAverager {
    tau_secs: f64,
    smoothed_bps: f64,
}

impl ThroughputAverager {
    pub fn new(tau_secs: f64) -> Self {
        Self { tau_secs, smoothed_bps: 0.0 }
    }

    pub fn update(&mut self, bytes_delta: u64, dt_secs: f64) -> f64 {
        let dt = dt_secs.max(1e-3);
        let alpha = 1.0 - (-dt / self.tau_secs).exp();
        let inst = (bytes_delta as f64) / dt;
        self.smoothed_bps = self.smoothed_bps * (1.0 - alpha) + inst * alpha;
        self.smoothed_bps
    }
}
