// Copyright 2026 Bosun Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Liveness bookkeeping for one streaming connection. The transport drives it:
//! it sends a ping when [`Heartbeat::should_ping`] says so and closes the
//! connection once [`Heartbeat::expired`] reports a missed pong.

use std::time::{Duration, Instant};

pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PONG_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct Heartbeat {
    last_ping: Option<Instant>,
    last_pong: Instant,
}

impl Heartbeat {
    pub fn new(now: Instant) -> Self {
        Self {
            last_ping: None,
            last_pong: now,
        }
    }

    pub fn should_ping(&self, now: Instant) -> bool {
        self.last_ping
            .map_or(true, |last| now.duration_since(last) >= PING_INTERVAL)
    }

    pub fn record_ping(&mut self, now: Instant) {
        self.last_ping = Some(now);
    }

    pub fn record_pong(&mut self, now: Instant) {
        self.last_pong = now;
    }

    /// Whether the peer has gone a full pong window without answering.
    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_pong) > PONG_WAIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_cadence() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(start);
        assert!(heartbeat.should_ping(start));

        heartbeat.record_ping(start);
        assert!(!heartbeat.should_ping(start + Duration::from_secs(10)));
        assert!(heartbeat.should_ping(start + PING_INTERVAL));
    }

    #[test]
    fn test_missed_pong_expires_within_a_minute() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(start);
        assert!(!heartbeat.expired(start + PONG_WAIT));
        assert!(heartbeat.expired(start + PONG_WAIT + Duration::from_secs(1)));

        heartbeat.record_pong(start + PONG_WAIT);
        assert!(!heartbeat.expired(start + PONG_WAIT + Duration::from_secs(1)));
    }
}
