use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::cache::ConcreteCache;
use crate::error::{Error, Result};
use crate::provider::{BackingProvider, ProviderError, Providers};
use crate::range::{MemoryRange, RangeMap};
use crate::wire::{Operation, Request, Response, MAX_ACCESS_SIZE};

/// Counters kept per range.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LaneStats {
    /// Requests answered with [crate::Status::Ok].
    pub served: u64,

    /// Requests answered with [crate::Status::Fault] by the provider.
    pub faulted: u64,

    /// Reads answered from the cache without contacting the provider.
    pub cache_hits: u64,

    /// Accesses that reached the provider.
    pub forwarded: u64,
}

/// Reason a request was answered with a fault before reaching any range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    InvalidLength(usize),
    Unmapped { address: u64, length: usize },
    NotPermitted { range: String, op: Operation },
    MissingValue,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InvalidLength(length) => write!(f, "invalid access length {length}"),
            Rejection::Unmapped { address, length } => {
                write!(f, "{address:#x}+{length} is outside every configured range")
            }
            Rejection::NotPermitted { range, op } => {
                write!(f, "{op:?} is not permitted on range `{range}`")
            }
            Rejection::MissingValue => write!(f, "write request without a value"),
        }
    }
}

/// Validate a request and select the index of the range that serves it.
pub fn route(ranges: &RangeMap, request: &Request) -> std::result::Result<usize, Rejection> {
    if request.length == 0 || request.length > MAX_ACCESS_SIZE {
        return Err(Rejection::InvalidLength(request.length));
    }

    let (index, range) =
        ranges
            .lookup(request.address, request.length)
            .ok_or(Rejection::Unmapped {
                address: request.address,
                length: request.length,
            })?;

    if !range.permits(request.op) {
        return Err(Rejection::NotPermitted {
            range: range.name().to_string(),
            op: request.op,
        });
    }

    if request.op == Operation::Write && request.value.is_none() {
        return Err(Rejection::MissingValue);
    }

    Ok(index)
}

/// Serves every request routed to one range. A lane is owned by exactly one worker, which makes
/// it the single writer of its cache.
pub struct Lane {
    range: MemoryRange,
    provider: Arc<dyn BackingProvider>,
    cache: ConcreteCache,
    stats: LaneStats,
    lost: Option<String>,
}

impl Lane {
    pub fn new(range: MemoryRange, provider: Arc<dyn BackingProvider>) -> Self {
        Self {
            range,
            provider,
            cache: ConcreteCache::new(),
            stats: LaneStats::default(),
            lost: None,
        }
    }

    pub fn range(&self) -> &MemoryRange {
        &self.range
    }

    pub fn stats(&self) -> LaneStats {
        self.stats
    }

    pub fn cache(&self) -> &ConcreteCache {
        &self.cache
    }

    /// Reason the provider connection was lost, if it was.
    pub fn lost(&self) -> Option<&str> {
        self.lost.as_deref()
    }

    fn provider_failed(&mut self, request: &Request, err: ProviderError) -> Response {
        match err {
            ProviderError::Fault(reason) => {
                debug!(
                    range = %self.range.name(),
                    address = %format_args!("{:#x}", request.address),
                    "provider fault: {reason}"
                );
            }
            ProviderError::Lost(reason) => {
                warn!(range = %self.range.name(), "provider lost: {reason}");
                self.lost = Some(reason);
            }
        }

        self.stats.faulted += 1;
        Response::fault(request.id)
    }

    /// Answer a request already routed to this range.
    pub fn serve(&mut self, request: &Request) -> Response {
        if self.lost.is_some() {
            self.stats.faulted += 1;
            return Response::fault(request.id);
        }

        trace!(range = %self.range.name(), ?request, "serving request");
        match request.op {
            Operation::Read | Operation::Execute => {
                if let Some(value) = self.cache.get(request.address, request.length) {
                    self.stats.cache_hits += 1;
                    self.stats.served += 1;
                    return Response::ok(request.id, Some(value));
                }

                self.stats.forwarded += 1;
                match self.provider.read(request.address, request.length) {
                    Ok(value) => {
                        if self.range.is_concrete() {
                            self.cache.insert(request.address, request.length, value);
                        }

                        self.stats.served += 1;
                        Response::ok(request.id, Some(value))
                    }
                    Err(err) => self.provider_failed(request, err),
                }
            }
            Operation::Write => {
                let value = request.value.unwrap_or_default();
                if !self.range.write_back() {
                    // Only observable through this lane's cache
                    self.cache.insert(request.address, request.length, value);
                    self.stats.served += 1;
                    return Response::ok(request.id, None);
                }

                self.stats.forwarded += 1;
                match self.provider.write(request.address, request.length, value) {
                    Ok(()) => {
                        if self.range.is_concrete() {
                            self.cache.insert(request.address, request.length, value);
                        } else {
                            self.cache.invalidate(request.address, request.length);
                        }

                        self.stats.served += 1;
                        Response::ok(request.id, None)
                    }
                    Err(err) => self.provider_failed(request, err),
                }
            }
        }
    }
}

/// Synchronous forwarding dispatcher. Useful when the caller already serializes requests; the
/// [crate::ForwardingChannel] runs the same lanes on worker threads.
pub struct Forwarder {
    ranges: RangeMap,
    lanes: Vec<Lane>,
    rejected: u64,
}

impl Forwarder {
    pub fn new(ranges: RangeMap, providers: &Providers) -> Result<Self> {
        let lanes = ranges
            .iter()
            .map(|range| {
                providers
                    .get(range.provider())
                    .map(|provider| Lane::new(range.clone(), provider))
                    .ok_or_else(|| Error::UnknownProvider {
                        range: range.name().to_string(),
                        provider: range.provider().to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            ranges,
            lanes,
            rejected: 0,
        })
    }

    pub fn ranges(&self) -> &RangeMap {
        &self.ranges
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    /// Requests rejected before reaching a range.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn serve(&mut self, request: &Request) -> Response {
        match route(&self.ranges, request) {
            Ok(index) => self.lanes[index].serve(request),
            Err(rejection) => {
                debug!(id = request.id, "rejected request: {rejection}");
                self.rejected += 1;
                Response::fault(request.id)
            }
        }
    }

    /// Reason any provider connection was lost.
    pub fn lost(&self) -> Option<&str> {
        self.lanes.iter().find_map(Lane::lost)
    }

    pub(crate) fn into_lanes(self) -> (RangeMap, Vec<Lane>) {
        (self.ranges, self.lanes)
    }
}
