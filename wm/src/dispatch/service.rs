//! Service channel: bulk operations for trusted system components

use tracing::{info, warn};

use super::client::apply_group_change;
use super::{Ctx, Handler, HandlerResult, matches_filter};
use crate::args;
use crate::error::WmResult;
use crate::instance::InstanceKey;
use crate::master::Master;
use crate::protocol::Args;

pub(super) const VERBS: &[(&str, Handler)] = &[
    ("update", update),
    ("refresh", refresh),
    ("instanceCount", instance_count),
    ("changeGroup", change_group),
];

/// Active instances matching a package/cluster/category filter
pub(super) fn select(m: &Master, pkg: &str, cluster: &str, category: &str) -> Vec<InstanceKey> {
    m.instances
        .instances()
        .filter(|i| matches_filter(pkg, &i.pkg))
        .filter(|i| matches_filter(cluster, &i.cluster) && matches_filter(category, &i.category))
        .filter(|i| i.ensure_active().is_ok())
        .map(|i| i.key())
        .collect()
}

/// Ask each instance's worker for fresh content.
///
/// Every instance is asked even if an earlier one fails; the first failure is
/// returned afterwards.
pub(super) fn request_updates(m: &mut Master, keys: Vec<InstanceKey>, force: bool) -> WmResult<usize> {
    let count = keys.len();
    let mut first_err = None;
    for (pkg, id) in keys {
        let args = args![pkg.as_str(), id.as_str(), i32::from(force)];
        if let Err(e) = m.forward_to_slave(&pkg, &id, "update_content", args) {
            warn!(%pkg, %id, error = %e, "request_updates: instance not updated");
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(count),
    }
}

/// `update(cluster, category, pkg, force)` returns `(0, count)`
fn update(m: &mut Master, _ctx: &Ctx, args: &Args) -> HandlerResult {
    let (cluster, category, pkg) = (args.str(0)?, args.str(1)?, args.str(2)?);
    let force = args.bool(3).unwrap_or(false);
    let keys = select(m, pkg, cluster, category);
    let count = request_updates(m, keys, force)?;
    info!(%cluster, %category, %pkg, force, count, "Bulk update requested");
    Ok(Some(args![0, count]))
}

/// `refresh(pkg[, force])` returns `(0, count)`
fn refresh(m: &mut Master, _ctx: &Ctx, args: &Args) -> HandlerResult {
    let pkg = args.name(0)?;
    let force = args.bool(1).unwrap_or(false);
    let keys = select(m, pkg, "", "");
    let count = request_updates(m, keys, force)?;
    Ok(Some(args![0, count]))
}

/// `instanceCount(pkg, cluster, category)` counts live instances, active or not
fn instance_count(m: &mut Master, _ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, cluster, category) = (args.str(0)?, args.str(1)?, args.str(2)?);
    let count = m
        .instances
        .instances()
        .filter(|i| i.ensure_alive().is_ok())
        .filter(|i| matches_filter(pkg, &i.pkg))
        .filter(|i| matches_filter(cluster, &i.cluster) && matches_filter(category, &i.category))
        .count();
    Ok(Some(args![0, count]))
}

/// `changeGroup(pkg, id, cluster, category)` without an ownership check
fn change_group(m: &mut Master, _ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, id) = (args.name(0)?, args.name(1)?);
    apply_group_change(m, pkg, id, args.str(2)?, args.str(3)?)?;
    Ok(None)
}
