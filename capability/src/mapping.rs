//! Fixed mapping from declared permission tags to capability names.

use kiwi_types::{Capability, CapabilitySet, PermissionAction, PermissionSpec};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PermissionMapError {
    #[error("no capability mapping for {action:?} on resource '{resource}'")]
    UnknownPermission {
        action: PermissionAction,
        resource: String,
    },
    #[error("permission on '{resource}' does not take an id")]
    UnexpectedId { resource: String },
}

/// Capability resource slug for a declared resource name.
fn resource_slug(resource: &str) -> Option<&'static str> {
    match resource {
        "filesystem" => Some("fs"),
        "network" => Some("net"),
        "knowledge" => Some("kb"),
        _ => None,
    }
}

/// Map a directive's declared permissions to a capability set.
///
/// The table is fixed:
/// - `<read resource="filesystem"/>` → `fs.read` (likewise write, network,
///   knowledge)
/// - `<execute resource="tool" id="bash"/>` → `tool.bash`; `id="*"` grants
///   the whole `tool` resource
/// - `<spawn resource="thread"/>` → `spawn.thread`
pub fn permissions_to_caps(specs: &[PermissionSpec]) -> Result<CapabilitySet, PermissionMapError> {
    let mut set = CapabilitySet::new();
    for spec in specs {
        match (spec.action, spec.resource.as_str()) {
            (PermissionAction::Execute, "tool") => match spec.id.as_deref() {
                Some("*") => set.grant_resource("tool"),
                Some(id) => {
                    let cap = Capability::parse(&format!("tool.{id}")).map_err(|_| {
                        PermissionMapError::UnknownPermission {
                            action: spec.action,
                            resource: format!("tool/{id}"),
                        }
                    })?;
                    set.grant(cap);
                }
                None => {
                    return Err(PermissionMapError::UnknownPermission {
                        action: spec.action,
                        resource: spec.resource.clone(),
                    });
                }
            },
            (PermissionAction::Spawn, "thread") => {
                reject_id(spec)?;
                set.grant(Capability::parse("spawn.thread").expect("static capability"));
            }
            (PermissionAction::Read | PermissionAction::Write, resource) => {
                reject_id(spec)?;
                let slug = resource_slug(resource).ok_or_else(|| {
                    PermissionMapError::UnknownPermission {
                        action: spec.action,
                        resource: resource.to_string(),
                    }
                })?;
                let action = match spec.action {
                    PermissionAction::Read => "read",
                    _ => "write",
                };
                set.grant(Capability::parse(&format!("{slug}.{action}")).expect("static capability"));
            }
            _ => {
                return Err(PermissionMapError::UnknownPermission {
                    action: spec.action,
                    resource: spec.resource.clone(),
                });
            }
        }
    }
    Ok(set)
}

fn reject_id(spec: &PermissionSpec) -> Result<(), PermissionMapError> {
    if spec.id.is_some() {
        return Err(PermissionMapError::UnexpectedId {
            resource: spec.resource.clone(),
        });
    }
    Ok(())
}
