//! Random Early Detection queueing. The queue length is tracked in bits
//! and decays at line rate between arrivals; an exponentially weighted
//! moving average of it selects the drop-probability region, and the
//! wait-option modulation spreads drops out to roughly uniform inter-drop
//! gaps (as in ns-2).

use log::debug;
use netloom::{Ltime, TickScale};
use rand_core::RngCore;

use crate::queue::uniform;

const DEFAULT_WEIGHT: f64 = 0.0001;
const DEFAULT_PMAX: f64 = 0.2;
const DEFAULT_MEAN_PKTSIZ: f64 = 500.0 * 8.0;

/// Tunables for a RED queue; zeros select the derived defaults at build.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RedParams {
    /// EWMA coefficient in [0, 1); 0 derives `1 - exp(-1/C)` from the
    /// bitrate in mean packets.
    pub weight: f64,
    /// Lower average-queue threshold, bytes; 0 derives 5% of the buffer.
    pub qmin: f64,
    /// Upper average-queue threshold, bytes; 0 derives 50% of the buffer.
    pub qmax: f64,
    /// Cap on the average queue, bytes; 0 derives min(buffer, 2*qmax).
    pub qcap: f64,
    /// Maximum drop probability in (0, 1].
    pub pmax: f64,
    /// Spread drops to uniform inter-drop gaps.
    pub wait: bool,
    /// Mean packet size in bytes, for idle-decay accounting.
    pub mean_pktsiz: f64,
    /// Select the alternative qmax..qcap loss formula.
    pub mix_experimental: bool,
}

impl Default for RedParams {
    fn default() -> Self {
        RedParams {
            weight: DEFAULT_WEIGHT,
            qmin: 0.0,
            qmax: 0.0,
            qcap: 0.0,
            pmax: DEFAULT_PMAX,
            wait: true,
            mean_pktsiz: DEFAULT_MEAN_PKTSIZ / 8.0,
            mix_experimental: false,
        }
    }
}

pub struct RedQueue {
    bitrate: f64,
    latency: Ltime,
    jitter_range: f64,
    bufsize: u32,
    weight: f64,
    qmin: f64, // bits
    qmax: f64, // bits
    qcap: f64, // bits
    pmax: f64,
    wait_opt: bool,
    mean_pktsiz: f64, // bits
    mix_experimental: bool,
    queue: f64, // bits
    avgque: f64,
    loss: f64,
    crossing: bool,
    interdrop: f64, // bits since the last drop
    last_update_time: Ltime,
    vacate_time: Ltime,
    pub(crate) drops: u64,
}

impl RedQueue {
    pub fn new(
        bitrate: f64,
        latency: f64,
        jitter_range: f64,
        bufsize: u32,
        params: &RedParams,
        scale: TickScale,
    ) -> Result<Self, netloom::Error> {
        let mut weight = params.weight;
        if !(0.0..1.0).contains(&weight) {
            return Err(netloom::Error::Config(format!(
                "red weight ({weight}) must be in [0, 1)"
            )));
        }
        if weight == 0.0 {
            // from ns-2: a reasonable value is 1-exp(-1/C), where C is the
            // link bandwidth in mean packets
            weight = 1.0 - (-1.0 / (bitrate / 8.0 / 500.0)).exp();
        }

        let mut qmin = 8.0 * params.qmin;
        let mut qmax = 8.0 * params.qmax;
        let mut qcap = 8.0 * params.qcap;
        if qmin == 0.0 {
            qmin = 0.05 * 8.0 * bufsize as f64;
        }
        if qmax == 0.0 {
            qmax = 0.5 * 8.0 * bufsize as f64;
        }
        if qmin > qmax {
            return Err(netloom::Error::Config(format!(
                "red qmin ({qmin} b) must be no larger than qmax ({qmax} b)"
            )));
        }
        if qcap == 0.0 {
            qcap = (bufsize as f64 * 8.0).min(qmax * 2.0);
        }
        if qmax > qcap {
            return Err(netloom::Error::Config(format!(
                "red qmax ({qmax} b) must be no larger than qcap ({qcap} b)"
            )));
        }
        if !(params.pmax > 0.0 && params.pmax <= 1.0) {
            return Err(netloom::Error::Config(format!(
                "red pmax ({}) must be in (0, 1]",
                params.pmax
            )));
        }
        if params.mean_pktsiz <= 0.0 {
            return Err(netloom::Error::Config(format!(
                "red mean_pktsiz ({}) must be positive",
                params.mean_pktsiz
            )));
        }

        Ok(RedQueue {
            bitrate,
            latency: scale.d2t(latency),
            jitter_range,
            bufsize,
            weight,
            qmin,
            qmax,
            qcap,
            pmax: params.pmax,
            wait_opt: params.wait,
            mean_pktsiz: 8.0 * params.mean_pktsiz,
            mix_experimental: params.mix_experimental,
            queue: 0.0,
            avgque: 0.0,
            loss: 0.0,
            crossing: false,
            interdrop: 0.0,
            last_update_time: 0,
            vacate_time: 0,
            drops: 0,
        })
    }

    pub(crate) fn enqueue(
        &mut self,
        len: u32,
        now: Ltime,
        rng: &mut impl RngCore,
        scale: TickScale,
    ) -> Option<Ltime> {
        let bits = 8.0 * len as f64;
        let jitter = self.calibrate(bits, now, rng, scale);

        if self.queue + bits > 8.0 * self.bufsize as f64
            || self.loss >= 1.0
            || (self.loss > 0.0 && uniform(rng, 0.0, 1.0) < self.loss)
        {
            // the queue is full, or the packet is chosen according to the
            // RED policy: drop the entire packet
            debug!("red: drop packet ({} B, avgque {:.0} b, loss {:.4})", len, self.avgque, self.loss);
            self.interdrop = 0.0;
            self.drops += 1;
            return None;
        }

        self.queue += bits;
        let t = (scale.d2t(self.queue / self.bitrate) + 1) + self.latency + jitter;
        self.vacate_time = now + t;
        Some(t)
    }

    /// The current drop probability; exposed for tests.
    pub fn loss(&self) -> f64 {
        self.loss
    }

    fn calibrate(
        &mut self,
        bits: f64,
        now: Ltime,
        rng: &mut impl RngCore,
        scale: TickScale,
    ) -> Ltime {
        let mut jitter: Ltime = 0;
        let mut now = now;

        self.interdrop += bits;

        if self.jitter_range > 0.0 {
            let jitter_secs = uniform(rng, -1.0, 1.0) * self.jitter_range * bits / self.bitrate;
            jitter = scale.d2t(jitter_secs) + 1;
            now += jitter;
        }

        // decay the instantaneous queue at line rate since the last update
        self.queue -= self.bitrate * scale.t2d(now - self.last_update_time);
        self.queue = self.queue.clamp(0.0, 8.0 * self.bufsize as f64);
        self.last_update_time = now;

        // credit idle time as m mean packets of decay in the average
        let m = if now > self.vacate_time {
            (scale.t2d(now - self.vacate_time) * self.bitrate / self.mean_pktsiz) as i32
        } else {
            0
        };
        self.avgque *= (1.0 - self.weight).powi(m + 1);
        self.avgque += self.weight * self.queue;

        if self.queue == 0.0 || self.avgque < self.qmin {
            self.crossing = false; // next time is the first crossing again
            self.loss = 0.0;
        } else if !self.crossing {
            // first time crossing the threshold
            self.crossing = true;
            self.loss = 0.0;
            self.interdrop = 0.0;
        } else if self.avgque < self.qmax {
            self.loss = (self.avgque - self.qmin) / (self.qmax - self.qmin) * self.pmax;
        } else if self.mix_experimental {
            if self.avgque < self.qcap {
                self.loss = (self.avgque * (1.0 - self.pmax) / self.qmax + (2.0 * self.pmax - 1.0))
                    .min(1.0);
            } else {
                self.loss = 1.0;
            }
        } else if self.avgque < self.qcap {
            self.loss = (self.avgque - self.qmax) / (self.qcap - self.qmax) * (1.0 - self.pmax)
                + self.pmax;
        } else {
            self.loss = 1.0;
        }

        // make the inter-drop periods uniform instead of geometric (ns-2)
        let cnt = (self.interdrop / self.mean_pktsiz).floor();
        if self.wait_opt {
            if cnt * self.loss < 1.0 {
                self.loss = 0.0;
            } else if cnt * self.loss < 2.0 {
                self.loss /= 2.0 - cnt * self.loss;
            } else {
                self.loss = 1.0;
            }
        } else if cnt * self.loss < 1.0 {
            self.loss /= 1.0 - cnt * self.loss;
        } else {
            self.loss = 1.0;
        }
        if self.loss < 1.0 {
            self.loss *= bits / self.mean_pktsiz;
        }
        if self.loss > 1.0 {
            self.loss = 1.0;
        }

        jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_xoshiro::rand_core::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;

    fn params() -> RedParams {
        RedParams {
            weight: 0.0001,
            qmin: 5_000.0,
            qmax: 15_000.0,
            qcap: 30_000.0,
            pmax: 0.1,
            wait: false,
            mean_pktsiz: 500.0,
            mix_experimental: false,
        }
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let p = RedParams { qmin: 20_000.0, qmax: 10_000.0, ..params() };
        assert!(RedQueue::new(1e6, 0.0, 0.0, 40_000, &p, TickScale::new(6)).is_err());
    }

    #[test]
    fn base_loss_tracks_the_linear_region() {
        // drive avgque to ~10k bytes (the middle of qmin..qmax); the base
        // loss before modulation is pmax * (avg-qmin)/(qmax-qmin) ~ 0.05
        let scale = TickScale::new(6);
        let mut q = RedQueue::new(1e9, 0.0, 0.0, 1_000_000, &params(), scale).unwrap();
        let mut rng = Xoshiro256StarStar::seed_from_u64(7);

        // seed the average by holding the instantaneous queue around 10kB
        q.queue = 8.0 * 10_000.0;
        q.avgque = 8.0 * 10_000.0;
        q.crossing = true;
        q.interdrop = 0.0;

        // immediately after a drop (interdrop = 0) the wait modulation
        // floors the loss; accumulate arrivals until it re-arms, tracking
        // the linear-region base probability
        let mut measured = 0.0;
        for _ in 0..50 {
            let _ = q.enqueue(500, q.last_update_time, &mut rng, scale);
            // put the queue back so the region stays put
            q.queue = 8.0 * 10_000.0;
            q.avgque = 8.0 * 10_000.0;
            if q.loss > measured {
                measured = q.loss;
            }
        }
        // the unmodulated linear-region loss is 0.05; with cnt scaling it
        // grows past that, so seeing it above 0.04 means the region math
        // held
        assert!(measured > 0.04, "measured {measured}");
    }

    #[test]
    fn saturated_average_always_drops() {
        let scale = TickScale::new(6);
        let mut q = RedQueue::new(1e6, 0.0, 0.0, 40_000, &params(), scale).unwrap();
        let mut rng = Xoshiro256StarStar::seed_from_u64(7);
        q.queue = 8.0 * 35_000.0;
        q.avgque = 8.0 * 35_000.0; // beyond qcap
        q.crossing = true;
        q.interdrop = 100.0 * q.mean_pktsiz;
        assert!(q.enqueue(500, 0, &mut rng, scale).is_none());
        assert_eq!(q.drops, 1);
    }

    #[test]
    fn empty_queue_never_drops() {
        let scale = TickScale::new(6);
        let mut q = RedQueue::new(1e6, 0.0, 0.0, 40_000, &params(), scale).unwrap();
        let mut rng = Xoshiro256StarStar::seed_from_u64(7);
        for i in 0..10 {
            // widely spaced arrivals keep the queue near empty
            assert!(q.enqueue(500, i * 1_000_000, &mut rng, scale).is_some());
        }
        assert_eq!(q.drops, 0);
    }
}
