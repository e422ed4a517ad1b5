//! Resource addressing and path resolution.
//!
//! A request target is CSE-relative (no leading slash), SP-relative
//! (`~/csi/...` or `/csi/...`) or absolute (`_/spi/csi/...` or
//! `//spi/csi/...`). CSE-relative and the local part of the other forms
//! are either structured (`cseRn/.../rn`) or unstructured (a single
//! `ri`). The literal `-` as the first structured segment is rewritten
//! to the local CSE's resource name. A trailing virtual short-name
//! (`la`, `ol`, `fopt`, `pcu`) is split off before resolution and
//! reported separately for the dispatcher to handle.

use crate::error::{CseError, CseResult};
use crate::resource::types::VIRTUAL_NAMES;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    CseRelative,
    SpRelative,
    Absolute,
}

/// Classify a raw target path.
pub fn classify(path: &str) -> PathKind {
    if path.starts_with("//") || path.starts_with("_/") {
        PathKind::Absolute
    } else if path.starts_with('/') || path.starts_with("~/") {
        PathKind::SpRelative
    } else {
        PathKind::CseRelative
    }
}

/// Resolution result. Exactly the relevant fields are populated:
/// a local target carries `ri` (and `srn` when the path was structured);
/// a foreign target carries `csi` and the remainder path for retargeting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub ri: Option<String>,
    pub csi: Option<String>,
    pub srn: Option<String>,
    /// Trailing virtual short-name, stripped from the path
    pub virtual_name: Option<String>,
    /// Remainder path on a foreign CSE, used for retargeting
    pub remainder: Option<String>,
}

impl ResolvedTarget {
    pub fn is_foreign(&self) -> bool {
        self.remainder.is_some()
    }
}

/// Resolve a target path against the local tree.
///
/// `cse_rn`/`cse_csi` identify the local CSE; `cse_csi` carries its
/// leading slash. Unknown structured names resolve to `ri: None` so the
/// dispatcher can answer `notFound`.
pub async fn resolve_target(
    storage: &dyn Storage,
    path: &str,
    cse_rn: &str,
    cse_csi: &str,
) -> CseResult<ResolvedTarget> {
    if path.is_empty() {
        return Err(CseError::bad_request("empty request target"));
    }
    let csi_stem = cse_csi.strip_prefix('/').unwrap_or(cse_csi);

    // Normalize: "~/..." -> "/...", "_/..." -> "//..." were already
    // equivalent; strip the shortcut markers first.
    let normalized = if let Some(rest) = path.strip_prefix("~/") {
        format!("/{rest}")
    } else if let Some(rest) = path.strip_prefix("_/") {
        format!("//{rest}")
    } else {
        path.to_string()
    };

    let mut segments: Vec<String> = normalized
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect();
    if segments.is_empty() {
        return Err(CseError::bad_request("empty request target"));
    }

    let mut target = ResolvedTarget::default();
    if let Some(last) = segments.last() {
        if VIRTUAL_NAMES.contains(&last.as_str()) {
            target.virtual_name = segments.pop();
        }
    }
    if segments.is_empty() {
        return Err(CseError::bad_request("virtual name without a base resource"));
    }

    let local_segments: Vec<String> = match classify(&normalized) {
        PathKind::Absolute => {
            // //spi/csi/...
            if segments.len() < 2 {
                return Err(CseError::bad_request("malformed absolute address"));
            }
            let csi = segments[1].clone();
            if csi != csi_stem {
                return Ok(foreign(csi, &segments[1..], target));
            }
            segments[2..].to_vec()
        }
        PathKind::SpRelative => {
            let csi = segments[0].clone();
            if csi != csi_stem {
                return Ok(foreign(csi, &segments, target));
            }
            segments[1..].to_vec()
        }
        PathKind::CseRelative => segments,
    };

    if local_segments.is_empty() {
        // The path addressed the CSE itself by csi
        let ri = storage
            .resource_by_csi(cse_csi)
            .await?
            .map(|cse| cse.ri().to_string());
        target.ri = ri;
        return Ok(target);
    }

    let first = local_segments[0].as_str();
    let structured = local_segments.len() > 1 || first == cse_rn || first == "-";
    if structured {
        let mut parts = local_segments.clone();
        if parts[0] == "-" {
            parts[0] = cse_rn.to_string();
        }
        let srn = parts.join("/");
        target.ri = storage.resolve_srn(&srn).await?;
        target.srn = Some(srn);
    } else {
        target.ri = Some(first.to_string());
    }
    Ok(target)
}

fn foreign(csi: String, segments: &[String], mut target: ResolvedTarget) -> ResolvedTarget {
    let mut remainder = segments.join("/");
    if let Some(vr) = &target.virtual_name {
        remainder = format!("{remainder}/{vr}");
    }
    target.csi = Some(format!("/{csi}"));
    target.remainder = Some(format!("/{remainder}"));
    target
}

/// Structured name of a new child under a parent.
pub fn child_srn(parent_srn: &str, rn: &str) -> String {
    if parent_srn.is_empty() {
        rn.to_string()
    } else {
        format!("{parent_srn}/{rn}")
    }
}

/// Strip the SP-relative prefix from an originator (`/csi/Cabc` -> `Cabc`).
pub fn originator_id_stem(originator: &str) -> &str {
    if originator.starts_with('/') {
        originator.rsplit('/').next().unwrap_or(originator)
    } else {
        originator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Resource, ResourceType};
    use crate::storage::InMemoryStorage;
    use serde_json::json;

    async fn seeded() -> InMemoryStorage {
        let storage = InMemoryStorage::new();
        let cse = Resource::new(
            ResourceType::CseBase,
            json!({"ri": "id-in", "rn": "cse-in", "pi": "", "csi": "/id-in", "ty": 5})
                .as_object()
                .cloned()
                .unwrap(),
        );
        storage.put_resource(&cse, "cse-in").await.unwrap();
        let cnt = Resource::new(
            ResourceType::Cnt,
            json!({"ri": "cnt-1", "rn": "data", "pi": "id-in", "ty": 3})
                .as_object()
                .cloned()
                .unwrap(),
        );
        storage.put_resource(&cnt, "cse-in/data").await.unwrap();
        storage
    }

    #[test]
    fn classification() {
        assert_eq!(classify("cse-in/data"), PathKind::CseRelative);
        assert_eq!(classify("abcd1234"), PathKind::CseRelative);
        assert_eq!(classify("~/id-in/cse-in/data"), PathKind::SpRelative);
        assert_eq!(classify("/id-in/abcd1234"), PathKind::SpRelative);
        assert_eq!(classify("//sp.example/id-in/cse-in"), PathKind::Absolute);
        assert_eq!(classify("_/sp.example/id-in/cse-in"), PathKind::Absolute);
    }

    #[tokio::test]
    async fn structured_resolution() {
        let storage = seeded().await;
        let target = resolve_target(&storage, "cse-in/data", "cse-in", "/id-in")
            .await
            .unwrap();
        assert_eq!(target.ri.as_deref(), Some("cnt-1"));
        assert_eq!(target.srn.as_deref(), Some("cse-in/data"));
        assert!(!target.is_foreign());
    }

    #[tokio::test]
    async fn dash_rewrites_to_cse_rn() {
        let storage = seeded().await;
        let target = resolve_target(&storage, "-/data", "cse-in", "/id-in")
            .await
            .unwrap();
        assert_eq!(target.ri.as_deref(), Some("cnt-1"));
    }

    #[tokio::test]
    async fn unstructured_resolution() {
        let storage = seeded().await;
        let target = resolve_target(&storage, "cnt-1", "cse-in", "/id-in")
            .await
            .unwrap();
        assert_eq!(target.ri.as_deref(), Some("cnt-1"));
        assert_eq!(target.srn, None);
    }

    #[tokio::test]
    async fn sp_relative_local() {
        let storage = seeded().await;
        let target = resolve_target(&storage, "~/id-in/cse-in/data", "cse-in", "/id-in")
            .await
            .unwrap();
        assert_eq!(target.ri.as_deref(), Some("cnt-1"));
    }

    #[tokio::test]
    async fn sp_relative_foreign_retargets() {
        let storage = seeded().await;
        let target = resolve_target(&storage, "~/id-mn/cse-mn/data", "cse-in", "/id-in")
            .await
            .unwrap();
        assert!(target.is_foreign());
        assert_eq!(target.csi.as_deref(), Some("/id-mn"));
        assert_eq!(target.remainder.as_deref(), Some("/id-mn/cse-mn/data"));
    }

    #[tokio::test]
    async fn virtual_suffix_is_split() {
        let storage = seeded().await;
        let target = resolve_target(&storage, "cse-in/data/la", "cse-in", "/id-in")
            .await
            .unwrap();
        assert_eq!(target.ri.as_deref(), Some("cnt-1"));
        assert_eq!(target.virtual_name.as_deref(), Some("la"));
    }

    #[tokio::test]
    async fn hybrid_id_with_virtual_suffix() {
        let storage = seeded().await;
        let target = resolve_target(&storage, "cnt-1/ol", "cse-in", "/id-in")
            .await
            .unwrap();
        assert_eq!(target.ri.as_deref(), Some("cnt-1"));
        assert_eq!(target.virtual_name.as_deref(), Some("ol"));
    }

    #[tokio::test]
    async fn csi_only_addresses_cse_base() {
        let storage = seeded().await;
        let target = resolve_target(&storage, "~/id-in", "cse-in", "/id-in")
            .await
            .unwrap();
        assert_eq!(target.ri.as_deref(), Some("id-in"));
    }
}
