//! The forwarding table: longest-prefix destination lookup over a binary
//! trie, with an optional route cache in front. Any mutation of the trie
//! invalidates every cache entry.

use log::debug;
use netloom::{IpAddr, IpPrefix};

use crate::session::ProtocolNum;

/// Which routing machinery installed a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingProtocol {
    Unspec,
    Static,
    Ospf,
    Bgp,
}

/// One forwarding entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteInfo {
    pub destination: IpPrefix,
    pub next_hop: IpAddr,
    pub iface: u32,
    pub cost: i32,
    pub protocol: RoutingProtocol,
    pub resolved: bool,
}

impl RouteInfo {
    pub fn new(destination: IpPrefix, next_hop: IpAddr, iface: u32) -> Self {
        RouteInfo {
            destination,
            next_hop,
            iface,
            cost: 1,
            protocol: RoutingProtocol::Static,
            resolved: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddRouteResult {
    Success,
    Overwritten,
    NotReplaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveRouteResult {
    Success,
    NotFound,
}

/// The cache disciplines in front of the trie.
pub enum RouteCache {
    None,
    SingleEntry(Option<(IpAddr, RouteInfo)>),
    DirectMapped(Vec<Option<(IpAddr, RouteInfo)>>),
    Associative { entries: Vec<(IpAddr, RouteInfo)>, cap: usize },
}

impl RouteCache {
    pub fn direct_mapped(slots: usize) -> Self {
        RouteCache::DirectMapped(vec![None; slots])
    }

    pub fn associative(cap: usize) -> Self {
        RouteCache::Associative { entries: Vec::new(), cap }
    }

    fn lookup(&self, a: IpAddr) -> Option<&RouteInfo> {
        match self {
            RouteCache::None => None,
            RouteCache::SingleEntry(e) => {
                e.as_ref().filter(|(addr, _)| *addr == a).map(|(_, r)| r)
            }
            RouteCache::DirectMapped(slots) => {
                let idx = a.0 as usize % slots.len();
                slots[idx].as_ref().filter(|(addr, _)| *addr == a).map(|(_, r)| r)
            }
            RouteCache::Associative { entries, .. } => {
                entries.iter().find(|(addr, _)| *addr == a).map(|(_, r)| r)
            }
        }
    }

    fn insert(&mut self, a: IpAddr, route: RouteInfo) {
        match self {
            RouteCache::None => {}
            RouteCache::SingleEntry(e) => *e = Some((a, route)),
            RouteCache::DirectMapped(slots) => {
                let idx = a.0 as usize % slots.len();
                slots[idx] = Some((a, route));
            }
            RouteCache::Associative { entries, cap } => {
                if entries.len() >= *cap {
                    entries.remove(0);
                }
                entries.push((a, route));
            }
        }
    }

    fn invalidate(&mut self) {
        match self {
            RouteCache::None => {}
            RouteCache::SingleEntry(e) => *e = None,
            RouteCache::DirectMapped(slots) => slots.iter_mut().for_each(|s| *s = None),
            RouteCache::Associative { entries, .. } => entries.clear(),
        }
    }
}

#[derive(Debug, Clone)]
struct TrieNode {
    children: [Option<u32>; 2],
    route: Option<RouteInfo>,
}

impl TrieNode {
    fn new() -> Self {
        TrieNode { children: [None, None], route: None }
    }
}

/// The forwarding table of one host.
pub struct ForwardingTable {
    nodes: Vec<TrieNode>,
    cache: RouteCache,
    listeners: Vec<ProtocolNum>,
}

impl Default for ForwardingTable {
    fn default() -> Self {
        Self::new()
    }
}

fn bit(a: IpAddr, i: u8) -> usize {
    ((a.0 >> (31 - i as u32)) & 1) as usize
}

impl ForwardingTable {
    pub fn new() -> Self {
        ForwardingTable {
            nodes: vec![TrieNode::new()],
            cache: RouteCache::None,
            listeners: Vec::new(),
        }
    }

    pub fn with_cache(cache: RouteCache) -> Self {
        ForwardingTable { nodes: vec![TrieNode::new()], cache, listeners: Vec::new() }
    }

    /// Register a session (by protocol number) to be notified of route
    /// changes.
    pub fn add_listener(&mut self, session: ProtocolNum) {
        if !self.listeners.contains(&session) {
            self.listeners.push(session);
        }
    }

    pub fn listeners(&self) -> &[ProtocolNum] {
        &self.listeners
    }

    fn node_for_prefix(&mut self, prefix: IpPrefix) -> usize {
        let mut at = 0usize;
        for i in 0..prefix.len {
            let b = bit(prefix.addr, i);
            let next = match self.nodes[at].children[b] {
                Some(n) => n as usize,
                None => {
                    let n = self.nodes.len();
                    self.nodes.push(TrieNode::new());
                    self.nodes[at].children[b] = Some(n as u32);
                    n
                }
            };
            at = next;
        }
        at
    }

    pub fn add_route(&mut self, route: RouteInfo, replace: bool) -> AddRouteResult {
        let at = self.node_for_prefix(route.destination);
        let result = match &self.nodes[at].route {
            Some(_) if !replace => return AddRouteResult::NotReplaced,
            Some(_) => AddRouteResult::Overwritten,
            None => AddRouteResult::Success,
        };
        self.nodes[at].route = Some(route);
        self.cache.invalidate();
        result
    }

    pub fn remove_route(&mut self, route: &RouteInfo) -> RemoveRouteResult {
        let mut at = 0usize;
        for i in 0..route.destination.len {
            let b = bit(route.destination.addr, i);
            match self.nodes[at].children[b] {
                Some(n) => at = n as usize,
                None => return RemoveRouteResult::NotFound,
            }
        }
        match self.nodes[at].route.take() {
            Some(_) => {
                self.cache.invalidate();
                RemoveRouteResult::Success
            }
            None => RemoveRouteResult::NotFound,
        }
    }

    /// Longest-prefix match: the route whose prefix is the longest one
    /// containing `a`; the default route (length 0) if no longer prefix
    /// matches; `None` if the address is unroutable.
    pub fn get_route(&mut self, a: IpAddr) -> Option<RouteInfo> {
        if let Some(r) = self.cache.lookup(a) {
            return Some(r.clone());
        }

        let mut best: Option<&RouteInfo> = self.nodes[0].route.as_ref();
        let mut at = 0usize;
        for i in 0..32u8 {
            let b = bit(a, i);
            match self.nodes[at].children[b] {
                Some(n) => {
                    at = n as usize;
                    if let Some(r) = &self.nodes[at].route {
                        best = Some(r);
                    }
                }
                None => break,
            }
        }

        let found = best.cloned();
        if let Some(r) = &found {
            self.cache.insert(a, r.clone());
        } else {
            debug!("fib: {} unroutable", a);
        }
        found
    }

    /// Remove every route installed by `protocol` (or all routes for
    /// `Unspec`) and invalidate the cache.
    pub fn invalidate_all(&mut self, protocol: RoutingProtocol) {
        for node in &mut self.nodes {
            let matches = node
                .route
                .as_ref()
                .map(|r| protocol == RoutingProtocol::Unspec || r.protocol == protocol)
                .unwrap_or(false);
            if matches {
                node.route = None;
            }
        }
        self.cache.invalidate();
    }
}
