//! Request validation.
//!
//! Everything here runs before a record is persisted or a notification is
//! emitted; a failure is always a `BadRequest`.

use metalloc_id::{is_valid_logical_name, Identity};
use uuid::Uuid;

use crate::allocation::AllocationError;
use crate::model::{AllocationRequest, NewNode};

pub const MAX_RESOURCE_CLASS_LENGTH: usize = 80;
pub const MAX_TRAIT_LENGTH: usize = 255;

const CUSTOM_TRAIT_PREFIX: &str = "CUSTOM_";

/// Namespaces of the standard trait catalogue.
const STANDARD_TRAIT_NAMESPACES: &[&str] = &[
    "COMPUTE_", "HW_", "MISC_", "OWNER_", "STORAGE_",
];

/// A create request that passed validation.
///
/// Candidate identities still need resolving against the inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub uuid: Uuid,
    pub name: Option<String>,
    pub resource_class: String,
    pub traits: Vec<String>,
    pub candidates: Vec<Identity>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub fn validate_request(request: AllocationRequest) -> Result<ValidatedRequest, AllocationError> {
    let resource_class = validate_resource_class(request.resource_class.as_deref())?;
    let traits = validate_traits(&request.traits)?;
    let name = validate_name(request.name)?;
    let uuid = match request.uuid {
        Some(raw) => Uuid::parse_str(&raw).map_err(|_| {
            AllocationError::BadRequest(format!("Expected a UUID but received {raw}"))
        })?,
        None => Uuid::new_v4(),
    };
    let candidates = request
        .candidate_nodes
        .iter()
        .map(|raw| parse_candidate(raw))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ValidatedRequest {
        uuid,
        name,
        resource_class,
        traits,
        candidates,
        extra: request.extra,
    })
}

pub fn validate_resource_class(resource_class: Option<&str>) -> Result<String, AllocationError> {
    match resource_class {
        None | Some("") => Err(AllocationError::BadRequest(
            "resource_class is required".to_string(),
        )),
        Some(rc) if rc.chars().count() > MAX_RESOURCE_CLASS_LENGTH => {
            Err(AllocationError::BadRequest(format!(
                "resource_class '{rc}' is longer than {MAX_RESOURCE_CLASS_LENGTH} characters"
            )))
        }
        Some(rc) => Ok(rc.to_string()),
    }
}

/// Validates traits, dropping repeats while keeping first-seen order.
pub fn validate_traits(traits: &[String]) -> Result<Vec<String>, AllocationError> {
    let mut out: Vec<String> = Vec::with_capacity(traits.len());
    for t in traits {
        if !is_valid_trait(t) {
            return Err(AllocationError::BadRequest(format!(
                "Invalid trait '{t}': traits must be CUSTOM_ prefixed or belong to a standard namespace"
            )));
        }
        if !out.contains(t) {
            out.push(t.clone());
        }
    }
    Ok(out)
}

/// Returns true for `CUSTOM_` traits and traits in a standard namespace,
/// both spelled as an uppercase token.
pub fn is_valid_trait(t: &str) -> bool {
    if t.is_empty() || t.len() > MAX_TRAIT_LENGTH {
        return false;
    }
    if !t
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        return false;
    }
    std::iter::once(CUSTOM_TRAIT_PREFIX)
        .chain(STANDARD_TRAIT_NAMESPACES.iter().copied())
        .any(|prefix| t.len() > prefix.len() && t.starts_with(prefix))
}

pub fn validate_name(name: Option<String>) -> Result<Option<String>, AllocationError> {
    match name {
        Some(name) if !is_valid_logical_name(&name) => Err(AllocationError::BadRequest(format!(
            "Cannot create allocation with invalid name '{name}'"
        ))),
        other => Ok(other),
    }
}

fn parse_candidate(raw: &str) -> Result<Identity, AllocationError> {
    Identity::parse(raw).map_err(|_| {
        AllocationError::BadRequest(format!(
            "Cannot use node '{raw}' as a candidate: not a valid node name or UUID"
        ))
    })
}

/// Validates a node enrollment.
pub fn validate_new_node(node: &NewNode) -> Result<(), AllocationError> {
    validate_resource_class(Some(&node.resource_class))?;
    if let Some(name) = &node.name {
        if !is_valid_logical_name(name) {
            return Err(AllocationError::BadRequest(format!(
                "Cannot enroll node with invalid name '{name}'"
            )));
        }
    }
    if let Some(t) = node.traits.iter().find(|t| !is_valid_trait(t)) {
        return Err(AllocationError::BadRequest(format!("Invalid trait '{t}'")));
    }
    Ok(())
}
