use crate::conntrack::conn::Conn;
use crate::conntrack::flow_key::FlowKey;
use crate::dispatch::PipelineShared;
use crate::record::FinalizeReason;

use std::collections::VecDeque;
use std::time::Instant;

use hashlink::linked_hash_map::LinkedHashMap;
use hashlink::linked_hash_map::RawEntryMut;

/// Tracks inactive flow expiration.
pub(super) struct TimerWheel {
    /// Period to check for inactive flows (in milliseconds).
    period: usize,
    /// Start time of the `TimerWheel`.
    start_ts: Instant,
    /// Index of the next bucket to expire.
    next_bucket: usize,
    /// List of timers.
    timers: Vec<VecDeque<FlowKey>>,
}

impl TimerWheel {
    /// Creates a new `TimerWheel` with a maximum timeout of `max_timeout` and a timeout check
    /// period of `timeout_resolution`.
    pub(super) fn new(max_timeout: usize, timeout_resolution: usize) -> Self {
        if timeout_resolution > max_timeout {
            panic!("Timeout check period must be smaller than maximum inactivity timeout")
        }
        TimerWheel {
            period: timeout_resolution,
            start_ts: Instant::now(),
            next_bucket: 0,
            timers: vec![VecDeque::new(); max_timeout / timeout_resolution],
        }
    }

    /// Insert a new flow key into the timerwheel.
    #[inline]
    pub(super) fn insert(&mut self, key: &FlowKey, last_seen_ts: Instant, inactivity_window: usize) {
        let current_time = (last_seen_ts - self.start_ts).as_millis() as usize;
        let timer_index = ((current_time + inactivity_window) / self.period) % self.timers.len();
        log::debug!("Inserting into index: {}, {:?}", timer_index, current_time);
        self.timers[timer_index].push_back(key.to_owned());
    }

    /// Removes flows that have been inactive for at least their inactivity
    /// window, finalizing each with `IdleTimeout`.
    ///
    /// Returns the number of flows removed.
    #[inline]
    pub(super) fn check_inactive(
        &mut self,
        now: Instant,
        table: &mut LinkedHashMap<FlowKey, Conn>,
        shared: &PipelineShared,
    ) -> usize {
        let period = self.period;
        let nb_buckets = self.timers.len();
        let mut not_expired: Vec<(usize, FlowKey)> = vec![];
        let check_time = (now - self.start_ts).as_millis() as usize / period * period;

        let mut cnt_exp = 0;
        let last_expire_bucket = check_time / period;
        log::debug!(
            "check time: {}, next: {}, last: {}",
            check_time,
            self.next_bucket,
            last_expire_bucket
        );

        for expire_bucket in self.next_bucket..last_expire_bucket {
            let list = &mut self.timers[expire_bucket % nb_buckets];

            for key in list.drain(..) {
                if let RawEntryMut::Occupied(mut occupied) = table.raw_entry_mut().from_key(&key) {
                    let conn = occupied.get_mut();
                    let last_seen_time = (conn.last_seen_ts - self.start_ts).as_millis() as usize;
                    let expire_time = last_seen_time + conn.inactivity_window;
                    if expire_time < check_time {
                        cnt_exp += 1;
                        conn.finalize(FinalizeReason::IdleTimeout, shared);
                        occupied.remove();
                    } else {
                        let timer_index = (expire_time / period) % nb_buckets;
                        not_expired.push((timer_index, key));
                    }
                }
            }
            for (timer_index, key) in not_expired.drain(..) {
                self.timers[timer_index].push_back(key);
            }
        }
        self.next_bucket = last_expire_bucket;
        cnt_exp
    }
}
