//! Timer handling: the per-session slow/fast timer ticks, the
//! Jacobson/Karels RTO estimator, and the exponential backoff.

use log::debug;
use netloom::Ltime;

use crate::socket::signal;
use crate::tcp::message::{TCP_FLAG_ACK, TCP_FLAG_RST};
use crate::tcp::session::{TcpEnv, TcpSession, TcpState};
use crate::tcp::{TcpConfig, TcpVersion, BACKOFF, RTTVAR_SHIFT, RTT_SHIFT, RXMIT_MAX_TIMEOUT, RXMIT_MIN_TIMEOUT};

impl TcpSession {
    /// One slow-timer tick: advance the RTT counter and count down the
    /// retransmission and 2MSL timers.
    pub(crate) fn slow_timeout_handling(&mut self, env: &mut TcpEnv<'_, '_>) {
        let mut sig: u32 = 0;

        if self.rtt_count > 0 {
            self.rtt_count += 1;
        }

        // a zero count means the timer is not armed
        if self.rxmit_timer_count > 0 {
            self.rxmit_timer_count -= env.cfg.slow_timeout;
            if self.rxmit_timer_count <= 0 {
                self.rxmit_timer_count = 0;
                sig |= self.retransmit_expired(env);
            }
        }

        if self.msl_timer_count > 0 {
            self.msl_timer_count -= env.cfg.slow_timeout;
            if self.msl_timer_count <= 0 {
                self.msl_timer_count = 0;
                sig |= self.msl_expired();
            }
        } else if self.state == TcpState::TimeWait {
            sig |= self.msl_expired();
        }

        if sig != 0 {
            self.wake_app(sig, env);
        }
    }

    fn retransmit_expired(&mut self, env: &mut TcpEnv<'_, '_>) -> u32 {
        debug!("tcp sock {}: retransmission timeout (nrxmits={})", self.socket, self.nrxmits);

        // all sacked state is stale after a timeout
        if env.cfg.version == TcpVersion::Sack {
            self.snd_scoreboard.clear_all_blocks();
        }

        // Karn: no measurement survives a retransmission
        self.rtt_count = 0;
        self.nrxmits += 1;
        self.recover_seq = self.sndwnd.as_ref().expect("send window").seq.first_unused();
        self.timeout_loss = true;
        self.backoff_timeout(env.cfg);

        if self.nrxmits <= env.cfg.max_rxmit {
            // slow-start over: half the window into the threshold, back to
            // one segment
            self.calc_threshold();
            self.cwnd = self.mss;
            self.ndupacks = 0;

            if self.nrxmits > env.cfg.max_rxmit / 4 {
                // the estimate is not to be trusted any more
                self.rtt_var += self.rtt_smoothed >> RTT_SHIFT;
                self.rtt_smoothed = 0;
            }

            self.rxmit_timer_count = 0;
            self.timeout_resend(env);
            0
        } else {
            // tried one time too many; the connection must be dead
            let seqno = self.sndwnd.as_ref().expect("send window").seq.first_unused();
            let ackno = self.rcvwnd.as_ref().expect("recv window").seq.expect();
            self.send_data(seqno, 0, TCP_FLAG_RST, ackno, false, false, env);
            self.reset(env);
            0
        }
    }

    fn msl_expired(&mut self) -> u32 {
        debug_assert_eq!(self.state, TcpState::TimeWait);
        signal::CONN_CLOSED | signal::SESSION_RELEASED
    }

    /// One fast-timer tick: flush a pending delayed ACK.
    pub(crate) fn fast_timeout_handling(&mut self, env: &mut TcpEnv<'_, '_>) {
        if self.delayed_ack_pending {
            let seqno = self.sndwnd.as_ref().expect("send window").seq.first_unused();
            let ackno = self.rcvwnd.as_ref().expect("recv window").expected_seqno();
            self.send_data(seqno, 0, TCP_FLAG_ACK, ackno, false, false, env);
            self.cancel_delay_ack(env);
        }
    }

    /// Fold a finished RTT measurement into the smoothed estimate and
    /// variance, then recompute the RTO.
    pub(crate) fn update_timeout(&mut self, env: &TcpEnv<'_, '_>) {
        if self.rtt_smoothed > 0 {
            let mut delta = self.rtt_measured - (self.rtt_smoothed >> RTT_SHIFT);
            self.rtt_smoothed += delta;
            if self.rtt_smoothed <= 0 {
                self.rtt_smoothed = 1;
            }
            if delta < 0 {
                delta = -delta;
            }
            delta -= self.rtt_var >> RTTVAR_SHIFT;
            self.rtt_var += delta;
            if self.rtt_var <= 0 {
                self.rtt_var = 1;
            }
        } else {
            self.rtt_smoothed = (self.rtt_measured + 1) << RTT_SHIFT;
            self.rtt_var = (self.rtt_measured + 1) << (RTTVAR_SHIFT - 1);
        }

        let secs = (env.cfg.slow_timeout_secs
            * ((self.rtt_smoothed >> RTT_SHIFT) + self.rtt_var) as f64)
            .clamp(RXMIT_MIN_TIMEOUT, RXMIT_MAX_TIMEOUT);
        self.rxmit_timeout = env.ctx.scale().d2t(secs);

        self.rtt_count = 0;
        self.nrxmits = 0;
        debug!(
            "tcp sock {}: rtt_measured={} rtt_smoothed={} rto={} ticks",
            self.socket, self.rtt_measured, self.rtt_smoothed, self.rxmit_timeout
        );
    }

    /// Exponential backoff of the RTO after a retransmission.
    pub(crate) fn backoff_timeout(&mut self, cfg: &TcpConfig) {
        let idx = (self.nrxmits as usize).min(BACKOFF.len() - 1);
        let secs = (cfg.slow_timeout_secs
            * BACKOFF[idx] as f64
            * ((self.rtt_smoothed >> RTT_SHIFT) + self.rtt_var) as f64)
            .clamp(RXMIT_MIN_TIMEOUT, RXMIT_MAX_TIMEOUT);
        self.rxmit_timeout_from_secs(secs, cfg);
    }

    fn rxmit_timeout_from_secs(&mut self, secs: f64, cfg: &TcpConfig) {
        // derive ticks through the configured slow interval so no tick
        // scale is needed here
        let ticks_per_sec = cfg.slow_timeout as f64 / cfg.slow_timeout_secs;
        self.rxmit_timeout = ((secs * ticks_per_sec).round() as Ltime).max(cfg.slow_timeout);
    }

    /// The RTO a fresh session starts from, before any measurement.
    pub(crate) fn initial_timeout_ticks(&self, cfg: &TcpConfig) -> Ltime {
        let secs = (((self.rtt_smoothed >> 2) + self.rtt_var) >> 1) as f64 * cfg.slow_timeout_secs;
        let ticks_per_sec = cfg.slow_timeout as f64 / cfg.slow_timeout_secs;
        ((secs * ticks_per_sec).round() as Ltime).max(cfg.slow_timeout)
    }

    /// An idle connection restarts from slow start once its quiet period
    /// exceeds the current RTO.
    pub(crate) fn check_idle(&mut self, env: &TcpEnv<'_, '_>) -> bool {
        let idle = self.sndwnd.as_ref().map(|sw| sw.seq.used() == 0).unwrap_or(false);
        if idle && env.now() - self.idle_time >= self.rxmit_timeout {
            self.cwnd = self.mss;
            return true;
        }
        false
    }
}
