//! Dispatch table for inbound subscription payloads
//!
//! Routing is an enumerable table keyed by (cluster, kind, id) rather
//! than branching inside the handlers, so the surface can be inspected
//! and tested in isolation. Unknown paths are dropped, never fatal.

use std::collections::HashMap;
use tracing::debug;

use crate::path::{
    AttributePath, ClusterId, CommandPath, EventPath, COMMISSIONER_CONTROL_CLUSTER,
    DESCRIPTOR_CLUSTER, PARTS_LIST_ATTRIBUTE, REQUEST_COMMISSIONING_APPROVAL_COMMAND,
    REVERSE_OPEN_WINDOW_EVENT, SUPPORTED_DEVICE_CATEGORIES_ATTRIBUTE,
};

/// What kind of payload a route key identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    Attribute,
    Event,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub cluster_id: ClusterId,
    pub kind: RouteKind,
    pub id: u32,
}

/// The handler a routed payload is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Bridge parts-list update, feeds the reconciler.
    PartsList,
    /// Supported device categories, answers a categories read.
    DeviceCategories,
    /// Commissioning-approval result, correlated against the outstanding
    /// request.
    CommissioningResult,
    /// Bridge-initiated request to open a local commissioning window.
    ReverseWindowOpen,
}

#[derive(Debug)]
pub struct SubscriptionRouter {
    table: HashMap<RouteKey, Route>,
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        let mut table = HashMap::new();
        table.insert(
            RouteKey {
                cluster_id: DESCRIPTOR_CLUSTER,
                kind: RouteKind::Attribute,
                id: PARTS_LIST_ATTRIBUTE,
            },
            Route::PartsList,
        );
        table.insert(
            RouteKey {
                cluster_id: COMMISSIONER_CONTROL_CLUSTER,
                kind: RouteKind::Attribute,
                id: SUPPORTED_DEVICE_CATEGORIES_ATTRIBUTE,
            },
            Route::DeviceCategories,
        );
        table.insert(
            RouteKey {
                cluster_id: COMMISSIONER_CONTROL_CLUSTER,
                kind: RouteKind::Command,
                id: REQUEST_COMMISSIONING_APPROVAL_COMMAND,
            },
            Route::CommissioningResult,
        );
        table.insert(
            RouteKey {
                cluster_id: COMMISSIONER_CONTROL_CLUSTER,
                kind: RouteKind::Event,
                id: REVERSE_OPEN_WINDOW_EVENT,
            },
            Route::ReverseWindowOpen,
        );
        Self { table }
    }

    fn resolve(&self, key: RouteKey) -> Option<Route> {
        let route = self.table.get(&key).copied();
        if route.is_none() {
            debug!(
                cluster_id = key.cluster_id,
                kind = ?key.kind,
                id = key.id,
                "Dropping payload for unknown path"
            );
        }
        route
    }

    pub fn route_attribute(&self, path: &AttributePath) -> Option<Route> {
        self.resolve(RouteKey {
            cluster_id: path.cluster_id,
            kind: RouteKind::Attribute,
            id: path.attribute_id,
        })
    }

    pub fn route_event(&self, path: &EventPath) -> Option<Route> {
        self.resolve(RouteKey {
            cluster_id: path.cluster_id,
            kind: RouteKind::Event,
            id: path.event_id,
        })
    }

    pub fn route_command(&self, path: &CommandPath) -> Option<Route> {
        self.resolve(RouteKey {
            cluster_id: path.cluster_id,
            kind: RouteKind::Command,
            id: path.command_id,
        })
    }

    /// All installed routes, for inspection.
    pub fn routes(&self) -> impl Iterator<Item = (&RouteKey, &Route)> {
        self.table.iter()
    }
}
