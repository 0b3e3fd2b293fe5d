use std::{
    collections::HashMap,
    net::IpAddr,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Socket events allowed per window, per remote address.
pub const WS_MAX_EVENTS: u32 = 100;
pub const WS_WINDOW: Duration = Duration::from_secs(10);
pub const WS_COOLDOWN: Duration = Duration::from_secs(5);

/// HTTP windows are a fixed minute with per-endpoint caps.
pub const HTTP_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed,
    /// Denied, with the number of seconds until the next attempt may pass.
    Limited { retry_after: f64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

#[derive(Debug)]
struct Bucket {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

/// Token bucket for the message channel: 100 events per 10 s per remote
/// address, with a 5 s cooldown once exceeded. Localhost bypasses.
#[derive(Debug, Default)]
pub struct WsRateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl WsRateLimiter {
    pub fn check(&self, addr: IpAddr) -> Decision {
        self.check_at(addr, Instant::now())
    }

    fn check_at(&self, addr: IpAddr, now: Instant) -> Decision {
        if addr.is_loopback() {
            return Decision::Allowed;
        }

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(addr).or_insert_with(|| Bucket {
            count: 0,
            window_start: now,
            blocked_until: None,
        });

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return Decision::Limited {
                    retry_after: until.duration_since(now).as_secs_f64(),
                };
            }

            bucket.blocked_until = None;
            bucket.count = 0;
            bucket.window_start = now;
        }

        if now.duration_since(bucket.window_start) >= WS_WINDOW {
            bucket.count = 0;
            bucket.window_start = now;
        }

        bucket.count += 1;

        if bucket.count > WS_MAX_EVENTS {
            bucket.blocked_until = Some(now + WS_COOLDOWN);

            return Decision::Limited {
                retry_after: WS_COOLDOWN.as_secs_f64(),
            };
        }

        Decision::Allowed
    }

    pub fn purge_stale(&self, max_idle: Duration) {
        let now = Instant::now();

        self.buckets
            .lock()
            .retain(|_, bucket| now.duration_since(bucket.window_start) < max_idle);
    }
}

#[derive(Debug)]
struct Window {
    count: u32,
    started: Instant,
}

/// Fixed one-minute windows per (address, endpoint) pair. Localhost
/// bypasses here too.
#[derive(Debug, Default)]
pub struct HttpRateLimiter {
    windows: Mutex<HashMap<(IpAddr, &'static str), Window>>,
}

impl HttpRateLimiter {
    pub fn check(&self, addr: IpAddr, endpoint: &'static str, cap: u32) -> bool {
        self.check_at(addr, endpoint, cap, Instant::now())
    }

    fn check_at(&self, addr: IpAddr, endpoint: &'static str, cap: u32, now: Instant) -> bool {
        if addr.is_loopback() {
            return true;
        }

        let mut windows = self.windows.lock();
        let window = windows.entry((addr, endpoint)).or_insert_with(|| Window {
            count: 0,
            started: now,
        });

        if now.duration_since(window.started) >= HTTP_WINDOW {
            window.count = 0;
            window.started = now;
        }

        window.count += 1;
        window.count <= cap
    }

    pub fn purge_stale(&self, max_idle: Duration) {
        let now = Instant::now();

        self.windows
            .lock()
            .retain(|_, window| now.duration_since(window.started) < max_idle);
    }
}
