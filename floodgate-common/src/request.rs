//! Request descriptors consumed by admission control

use axum::http::Method;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use uuid::Uuid;

/// Admission traffic class of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    /// Anything that is not a mutation (GET, HEAD, OPTIONS, ...)
    Read,
    /// POST, PATCH and DELETE
    Mutation,
}

impl TrafficClass {
    pub fn of(method: &Method) -> Self {
        if *method == Method::POST || *method == Method::PATCH || *method == Method::DELETE {
            TrafficClass::Mutation
        } else {
            TrafficClass::Read
        }
    }
}

/// One request as seen by a sliding window
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id: Uuid,
    pub method: Method,
    pub creation_time: Instant,
    /// Remote address and port, i.e. the socket
    pub remote_addr: SocketAddr,
    pub sent_bytes: u64,
}

impl RequestRecord {
    /// Record a request arriving now
    pub fn new(method: Method, remote_addr: SocketAddr) -> Self {
        Self::at(method, remote_addr, Instant::now())
    }

    /// Record a request with an explicit creation time
    pub fn at(method: Method, remote_addr: SocketAddr, creation_time: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            creation_time,
            remote_addr,
            sent_bytes: 0,
        }
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }

    pub fn is_mutation(&self) -> bool {
        self.traffic_class() == TrafficClass::Mutation
    }

    pub fn traffic_class(&self) -> TrafficClass {
        TrafficClass::of(&self.method)
    }
}
