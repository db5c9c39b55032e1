//! Typed create/delete callbacks.
//!
//! The dispatcher runs on the notification-processing task after the cache
//! lock is released, one event at a time in stream order. Handlers must
//! return promptly; a stalled handler stalls replication.

use tracing::{debug, warn};

use crate::apply::CacheEvent;
use crate::config::{
    TABLE_ACL, TABLE_ADDRESS_SET, TABLE_LOAD_BALANCER, TABLE_LOGICAL_ROUTER,
    TABLE_LOGICAL_ROUTER_PORT, TABLE_LOGICAL_SWITCH, TABLE_LOGICAL_SWITCH_PORT,
};
use crate::nb::{
    Acl, AddressSet, LoadBalancer, LogicalRouter, LogicalRouterPort, LogicalSwitch,
    LogicalSwitchPort,
};

/// Receiver for replica change events. Every method has a default no-op
/// body, so implementors override only what they watch.
#[allow(unused_variables)]
pub trait SignalHandler: Send + Sync {
    fn on_logical_switch_create(&self, ls: &LogicalSwitch) {}
    fn on_logical_switch_delete(&self, ls: &LogicalSwitch) {}

    fn on_logical_switch_port_create(&self, lsp: &LogicalSwitchPort) {}
    fn on_logical_switch_port_delete(&self, lsp: &LogicalSwitchPort) {}

    fn on_acl_create(&self, acl: &Acl) {}
    fn on_acl_delete(&self, acl: &Acl) {}

    fn on_address_set_create(&self, set: &AddressSet) {}
    fn on_address_set_delete(&self, set: &AddressSet) {}

    fn on_load_balancer_create(&self, lb: &LoadBalancer) {}
    fn on_load_balancer_delete(&self, lb: &LoadBalancer) {}

    fn on_logical_router_create(&self, lr: &LogicalRouter) {}
    fn on_logical_router_delete(&self, lr: &LogicalRouter) {}

    fn on_logical_router_port_create(&self, lrp: &LogicalRouterPort) {}
    fn on_logical_router_port_delete(&self, lrp: &LogicalRouterPort) {}
}

/// Resolve one event to its typed view and invoke the handler. Rows that
/// no longer decode are logged and skipped, never propagated.
pub(crate) fn dispatch(handler: &dyn SignalHandler, event: &CacheEvent) {
    let (table, uuid, row, created) = match event {
        CacheEvent::Created { table, uuid, row } => (table.as_str(), *uuid, row, true),
        CacheEvent::Deleted { table, uuid, row } => (table.as_str(), *uuid, row, false),
    };

    let outcome = match table {
        TABLE_LOGICAL_SWITCH => LogicalSwitch::from_row(uuid, row).map(|ls| {
            if created {
                handler.on_logical_switch_create(&ls)
            } else {
                handler.on_logical_switch_delete(&ls)
            }
        }),
        TABLE_LOGICAL_SWITCH_PORT => LogicalSwitchPort::from_row(uuid, row).map(|lsp| {
            if created {
                handler.on_logical_switch_port_create(&lsp)
            } else {
                handler.on_logical_switch_port_delete(&lsp)
            }
        }),
        TABLE_ACL => Acl::from_row(uuid, row).map(|acl| {
            if created {
                handler.on_acl_create(&acl)
            } else {
                handler.on_acl_delete(&acl)
            }
        }),
        TABLE_ADDRESS_SET => AddressSet::from_row(uuid, row).map(|set| {
            if created {
                handler.on_address_set_create(&set)
            } else {
                handler.on_address_set_delete(&set)
            }
        }),
        TABLE_LOAD_BALANCER => LoadBalancer::from_row(uuid, row).map(|lb| {
            if created {
                handler.on_load_balancer_create(&lb)
            } else {
                handler.on_load_balancer_delete(&lb)
            }
        }),
        TABLE_LOGICAL_ROUTER => LogicalRouter::from_row(uuid, row).map(|lr| {
            if created {
                handler.on_logical_router_create(&lr)
            } else {
                handler.on_logical_router_delete(&lr)
            }
        }),
        TABLE_LOGICAL_ROUTER_PORT => LogicalRouterPort::from_row(uuid, row).map(|lrp| {
            if created {
                handler.on_logical_router_port_create(&lrp)
            } else {
                handler.on_logical_router_port_delete(&lrp)
            }
        }),
        other => {
            debug!(table = %other, "no callback for table");
            Ok(())
        }
    };

    if let Err(err) = outcome {
        warn!(%table, %uuid, error = %err, "skipping event for undecodable row");
    }
}
