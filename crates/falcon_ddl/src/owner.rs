//! DDL owner lease.
//!
//! Only the worker holding an unexpired lease may advance jobs. Both
//! operations lock the owner record inside the caller's transaction, so a
//! takeover that commits first makes the caller's commit fail.

use std::time::{SystemTime, UNIX_EPOCH};

use falcon_common::error::{DdlError, FalconResult};
use falcon_storage::{Meta, OwnerRecord};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn lease_expiry(lease_ms: u64, now_ms: u64) -> u64 {
    if lease_ms == 0 {
        0
    } else {
        now_ms.saturating_add(lease_ms)
    }
}

/// Acquire the lease for `owner_id`, or renew it if already held. Fails with
/// `NotOwner` while another worker's lease is still valid.
pub fn campaign(
    meta: &mut Meta<'_>,
    owner_id: &str,
    lease_ms: u64,
    now_ms: u64,
) -> FalconResult<OwnerRecord> {
    meta.lock_ddl_owner()?;
    if let Some(current) = meta.get_ddl_owner()? {
        if current.owner_id != owner_id && !current.is_expired(now_ms) {
            return Err(DdlError::NotOwner {
                worker: owner_id.to_string(),
                owner: current.owner_id,
            }
            .into());
        }
        if current.owner_id != owner_id {
            tracing::info!(
                "DDL owner lease of {} expired, taken over by {}",
                current.owner_id,
                owner_id
            );
        }
    }
    let record = OwnerRecord {
        owner_id: owner_id.to_string(),
        expires_at_ms: lease_expiry(lease_ms, now_ms),
    };
    meta.set_ddl_owner(&record)?;
    Ok(record)
}

/// Require that `owner_id` holds a valid lease.
pub fn check_owner(meta: &mut Meta<'_>, owner_id: &str, now_ms: u64) -> FalconResult<()> {
    meta.lock_ddl_owner()?;
    let owner = match meta.get_ddl_owner()? {
        Some(rec) if rec.owner_id == owner_id && !rec.is_expired(now_ms) => return Ok(()),
        Some(rec) if rec.owner_id == owner_id => format!("{} (lease expired)", rec.owner_id),
        Some(rec) => rec.owner_id,
        None => "<none>".to_string(),
    };
    Err(DdlError::NotOwner {
        worker: owner_id.to_string(),
        owner,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use falcon_common::error::FalconError;
    use falcon_storage::{MemStorage, Storage};

    #[test]
    fn test_campaign_and_check() {
        let store = MemStorage::new();
        let mut txn = store.begin().unwrap();
        let mut meta = Meta::new(txn.as_mut());
        assert!(check_owner(&mut meta, "a", 0).is_err());

        let rec = campaign(&mut meta, "a", 100, 1_000).unwrap();
        assert_eq!(rec.expires_at_ms, 1_100);
        check_owner(&mut meta, "a", 1_050).unwrap();

        let err = check_owner(&mut meta, "b", 1_050).unwrap_err();
        assert!(matches!(err, FalconError::Ddl(DdlError::NotOwner { .. })));
        assert!(campaign(&mut meta, "b", 100, 1_050).is_err());
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let store = MemStorage::new();
        let mut txn = store.begin().unwrap();
        let mut meta = Meta::new(txn.as_mut());
        campaign(&mut meta, "a", 100, 1_000).unwrap();
        assert!(check_owner(&mut meta, "a", 1_100).is_err());

        let rec = campaign(&mut meta, "b", 100, 1_100).unwrap();
        assert_eq!(rec.owner_id, "b");
        check_owner(&mut meta, "b", 1_150).unwrap();
    }

    #[test]
    fn test_zero_lease_never_expires() {
        let store = MemStorage::new();
        let mut txn = store.begin().unwrap();
        let mut meta = Meta::new(txn.as_mut());
        let rec = campaign(&mut meta, "a", 0, 1_000).unwrap();
        assert_eq!(rec.expires_at_ms, 0);
        check_owner(&mut meta, "a", u64::MAX).unwrap();
        assert!(campaign(&mut meta, "b", 0, u64::MAX).is_err());
    }

    #[test]
    fn test_takeover_during_step_conflicts() {
        let store = MemStorage::new();
        let mut txn = store.begin().unwrap();
        campaign(&mut Meta::new(txn.as_mut()), "a", 0, 0).unwrap();
        txn.commit().unwrap();

        let mut step = store.begin().unwrap();
        check_owner(&mut Meta::new(step.as_mut()), "a", 0).unwrap();

        // owner record rewritten behind the step's back
        let mut other = store.begin().unwrap();
        Meta::new(other.as_mut())
            .set_ddl_owner(&OwnerRecord {
                owner_id: "b".into(),
                expires_at_ms: 0,
            })
            .unwrap();
        other.commit().unwrap();

        step.set(b"k", Vec::new()).unwrap();
        assert!(step.commit().unwrap_err().is_retryable());
    }
}
