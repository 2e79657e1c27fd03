//! Request admission engine
//!
//! Owns one [`SlidingWindow`] per (socket, traffic class) and one
//! [`RemoteIpData`] per source IP. Both maps are sharded concurrent maps:
//! entries are created lazily on first sight and looked up without a global
//! lock afterwards.

use crate::config::LimitsConfig;
use crate::request::{RequestRecord, TrafficClass};
use crate::window::{SharedSlidingWindow, SlidingWindow};
use axum::http::StatusCode;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Per-source-IP mitigation state
///
/// Lives for the lifetime of the engine; there is no eviction.
#[derive(Debug)]
pub struct RemoteIpData {
    ip: IpAddr,
    status_counts: Mutex<HashMap<u16, u64>>,
    shared_read_window: Arc<SharedSlidingWindow>,
    shared_write_window: Arc<SharedSlidingWindow>,
    blacklisted: AtomicBool,
}

impl RemoteIpData {
    fn new(ip: IpAddr, limits: &LimitsConfig) -> Self {
        Self {
            ip,
            status_counts: Mutex::new(HashMap::new()),
            shared_read_window: Arc::new(SharedSlidingWindow::new(limits.ip_read)),
            shared_write_window: Arc::new(SharedSlidingWindow::new(limits.ip_write)),
            blacklisted: AtomicBool::new(false),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// The IP-level window for a traffic class
    pub fn shared_window(&self, class: TrafficClass) -> &Arc<SharedSlidingWindow> {
        match class {
            TrafficClass::Read => &self.shared_read_window,
            TrafficClass::Mutation => &self.shared_write_window,
        }
    }

    pub fn is_blacklisted(&self) -> bool {
        self.blacklisted.load(Ordering::Acquire)
    }

    /// Snapshot of the response status histogram
    pub fn status_counts(&self) -> HashMap<u16, u64> {
        self.status_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record_status(&self, status: StatusCode) {
        let mut counts = self
            .status_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counts.entry(status.as_u16()).or_insert(0) += 1;
    }
}

/// Admission decisions for the HTTP request pipeline
pub struct SecurityEngine {
    limits: LimitsConfig,
    socket_windows: DashMap<(SocketAddr, TrafficClass), Arc<SlidingWindow>>,
    ip_data: DashMap<IpAddr, Arc<RemoteIpData>>,
}

impl SecurityEngine {
    pub fn new(limits: LimitsConfig) -> Self {
        info!(
            "Security engine: socket read {}/{}ms, socket write {}/{}ms, ip read {}/{}ms, ip write {}/{}ms",
            limits.socket_read.capacity,
            limits.socket_read.window_ms,
            limits.socket_write.capacity,
            limits.socket_write.window_ms,
            limits.ip_read.capacity,
            limits.ip_read.window_ms,
            limits.ip_write.capacity,
            limits.ip_write.window_ms,
        );
        Self {
            limits,
            socket_windows: DashMap::new(),
            ip_data: DashMap::new(),
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Returns `true` when the request must be rejected
    pub fn rate_limit_request(&self, record: &RequestRecord) -> bool {
        let ip_data = self.ip_data_or_create(record.remote_ip());
        if ip_data.is_blacklisted() {
            debug!(ip = %record.remote_ip(), "Rejecting request from blacklisted IP");
            return true;
        }

        let class = record.traffic_class();
        let window = self.socket_window_or_create(record.remote_addr, class, &ip_data);

        let rejected = !window.allow_request(record);
        if rejected {
            debug!(
                socket = %record.remote_addr,
                method = %record.method,
                request_id = %record.id,
                "Request rate limited"
            );
        }
        rejected
    }

    /// Bookkeeping once a response status is known
    pub fn post_handle(&self, record: &RequestRecord, status: StatusCode) {
        self.ip_data_or_create(record.remote_ip()).record_status(status);
    }

    /// Mark an IP as blacklisted; all of its later requests are rejected
    pub fn blacklist(&self, ip: IpAddr) {
        info!(%ip, "Blacklisting remote IP");
        self.ip_data_or_create(ip)
            .blacklisted
            .store(true, Ordering::Release);
    }

    pub fn ip_data(&self, ip: IpAddr) -> Option<Arc<RemoteIpData>> {
        self.ip_data.get(&ip).map(|entry| Arc::clone(entry.value()))
    }

    pub fn socket_window(&self, socket: SocketAddr, class: TrafficClass) -> Option<Arc<SlidingWindow>> {
        self.socket_windows
            .get(&(socket, class))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn status_counts(&self, ip: IpAddr) -> HashMap<u16, u64> {
        self.ip_data(ip)
            .map(|data| data.status_counts())
            .unwrap_or_default()
    }

    pub fn tracked_sockets(&self) -> usize {
        self.socket_windows.len()
    }

    pub fn tracked_ips(&self) -> usize {
        self.ip_data.len()
    }

    fn ip_data_or_create(&self, ip: IpAddr) -> Arc<RemoteIpData> {
        if let Some(existing) = self.ip_data.get(&ip) {
            return Arc::clone(existing.value());
        }
        let entry = self.ip_data.entry(ip).or_insert_with(|| {
            debug!(%ip, "Tracking new remote IP");
            Arc::new(RemoteIpData::new(ip, &self.limits))
        });
        Arc::clone(entry.value())
    }

    fn socket_window_or_create(
        &self,
        socket: SocketAddr,
        class: TrafficClass,
        ip_data: &RemoteIpData,
    ) -> Arc<SlidingWindow> {
        let key = (socket, class);
        if let Some(existing) = self.socket_windows.get(&key) {
            return Arc::clone(existing.value());
        }
        let entry = self.socket_windows.entry(key).or_insert_with(|| {
            let config = match class {
                TrafficClass::Read => self.limits.socket_read,
                TrafficClass::Mutation => self.limits.socket_write,
            };
            let parent = Arc::clone(ip_data.shared_window(class));
            Arc::new(SlidingWindow::with_parent(config, parent))
        });
        Arc::clone(entry.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use axum::http::Method;
    use std::time::{Duration, Instant};

    fn tight_limits() -> LimitsConfig {
        LimitsConfig {
            socket_read: WindowConfig::new(2, 1_000),
            socket_write: WindowConfig::new(1, 1_000),
            ip_read: WindowConfig::new(2, 1_000),
            ip_write: WindowConfig::new(2, 1_000),
        }
    }

    #[test]
    fn test_windows_created_lazily_and_wired_to_ip_window() {
        let engine = SecurityEngine::new(tight_limits());
        let socket: SocketAddr = "10.0.0.5:7000".parse().unwrap();
        assert_eq!(engine.tracked_sockets(), 0);

        assert!(!engine.rate_limit_request(&RequestRecord::new(Method::GET, socket)));
        assert!(!engine.rate_limit_request(&RequestRecord::new(Method::POST, socket)));

        assert_eq!(engine.tracked_sockets(), 2);
        assert_eq!(engine.tracked_ips(), 1);

        let window = engine.socket_window(socket, TrafficClass::Read).unwrap();
        let ip_data = engine.ip_data(socket.ip()).unwrap();
        let parent = window.parent().unwrap();
        assert!(Arc::ptr_eq(parent, ip_data.shared_window(TrafficClass::Read)));
    }

    #[test]
    fn test_read_and_write_budgets_are_separate() {
        let engine = SecurityEngine::new(tight_limits());
        let socket: SocketAddr = "10.0.0.5:7001".parse().unwrap();
        let t0 = Instant::now();

        assert!(!engine.rate_limit_request(&RequestRecord::at(Method::POST, socket, t0)));
        // write window is full, but reads are unaffected
        assert!(!engine.rate_limit_request(&RequestRecord::at(Method::GET, socket, t0)));
        assert!(!engine.rate_limit_request(&RequestRecord::at(Method::GET, socket, t0)));
    }

    #[test]
    fn test_burst_rejected_when_ip_window_refuses() {
        let engine = SecurityEngine::new(tight_limits());
        let socket: SocketAddr = "10.0.0.5:7002".parse().unwrap();
        let t0 = Instant::now();

        assert!(!engine.rate_limit_request(&RequestRecord::at(Method::GET, socket, t0)));
        assert!(!engine.rate_limit_request(&RequestRecord::at(Method::GET, socket, t0)));
        // socket window saturated; ip window of capacity 2 refuses a lone socket
        let third = RequestRecord::at(Method::GET, socket, t0 + Duration::from_millis(100));
        assert!(engine.rate_limit_request(&third));
        // expired records free the socket window again
        let fourth = RequestRecord::at(Method::GET, socket, t0 + Duration::from_millis(1_200));
        assert!(!engine.rate_limit_request(&fourth));
    }

    #[test]
    fn test_burst_absorbed_by_ip_window() {
        let limits = LimitsConfig {
            ip_read: WindowConfig::new(10, 1_000),
            ..tight_limits()
        };
        let engine = SecurityEngine::new(limits);
        let socket: SocketAddr = "10.0.0.6:7000".parse().unwrap();
        let t0 = Instant::now();

        assert!(!engine.rate_limit_request(&RequestRecord::at(Method::GET, socket, t0)));
        assert!(!engine.rate_limit_request(&RequestRecord::at(Method::GET, socket, t0)));
        // delegated to the ip window: 1 < 10 * 0.5
        assert!(!engine.rate_limit_request(&RequestRecord::at(Method::GET, socket, t0)));
        let ip_data = engine.ip_data(socket.ip()).unwrap();
        assert_eq!(ip_data.shared_window(TrafficClass::Read).window().occupied(), 1);
    }

    #[test]
    fn test_blacklisted_ip_always_rejected() {
        let engine = SecurityEngine::new(LimitsConfig::default());
        let socket: SocketAddr = "10.0.0.9:7000".parse().unwrap();
        engine.blacklist(socket.ip());
        assert!(engine.rate_limit_request(&RequestRecord::new(Method::GET, socket)));
    }

    #[test]
    fn test_post_handle_updates_histogram() {
        let engine = SecurityEngine::new(LimitsConfig::default());
        let socket: SocketAddr = "10.0.0.10:7000".parse().unwrap();
        let record = RequestRecord::new(Method::GET, socket);

        engine.post_handle(&record, StatusCode::OK);
        engine.post_handle(&record, StatusCode::OK);
        engine.post_handle(&record, StatusCode::NOT_FOUND);

        let counts = engine.status_counts(socket.ip());
        assert_eq!(counts.get(&200), Some(&2));
        assert_eq!(counts.get(&404), Some(&1));
        assert!(engine.status_counts("10.9.9.9".parse().unwrap()).is_empty());
    }
}
