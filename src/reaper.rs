use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Background sweep required for correctness: abandoned pending bookings
/// would otherwise starve capacity forever. Also retires bookings whose
/// window has fully elapsed.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now = now_ms();

        for (booking_id, _spot_id) in engine.collect_expired_pending(now) {
            match engine.expire_pending(booking_id, now).await {
                Ok(true) => info!("expired unpaid booking {booking_id}"),
                Ok(false) => {} // paid or cancelled between collect and sweep
                Err(e) => tracing::debug!("reaper skip {booking_id}: {e}"),
            }
        }

        for (booking_id, _spot_id) in engine.collect_overdue(now) {
            match engine.complete_booking(booking_id).await {
                Ok(()) => info!("completed elapsed booking {booking_id}"),
                Err(e) => tracing::debug!("reaper skip {booking_id}: {e}"),
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("compacted WAL after {appends} appends"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::DEFAULT_PAYMENT_TIMEOUT_MS;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reaper_collects_expired_pending() {
        let path = test_wal_path("reaper_collect.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify, DEFAULT_PAYMENT_TIMEOUT_MS).unwrap());

        let owner = Ulid::new();
        let spot_id = Ulid::new();
        engine
            .create_spot(spot_id, owner, None, 1, 100, 0.0, 0.0)
            .await
            .unwrap();

        let now = now_ms();
        let booking_id = Ulid::new();
        engine
            .reserve(
                booking_id,
                spot_id,
                Ulid::new(),
                Ulid::new(),
                Span::new(now + 3_600_000, now + 7_200_000),
            )
            .await
            .unwrap();

        // Not expired at its deadline minus a minute
        let deadline = engine.get_booking(booking_id).await.unwrap().pay_deadline;
        assert!(engine.collect_expired_pending(deadline - 60_000).is_empty());

        // One minute past the deadline it shows up
        let expired = engine.collect_expired_pending(deadline + 60_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, booking_id);

        // Sweep it; capacity is free again
        assert!(engine.expire_pending(booking_id, deadline + 60_000).await.unwrap());
        assert!(engine.collect_expired_pending(deadline + 60_000).is_empty());
        assert_eq!(
            engine.get_booking(booking_id).await.unwrap().status,
            BookingStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn sweep_skips_booking_paid_in_between() {
        let path = test_wal_path("reaper_race.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify, DEFAULT_PAYMENT_TIMEOUT_MS).unwrap());

        let owner = Ulid::new();
        let spot_id = Ulid::new();
        engine
            .create_spot(spot_id, owner, None, 1, 100, 0.0, 0.0)
            .await
            .unwrap();

        let now = now_ms();
        let booking_id = Ulid::new();
        engine
            .reserve(
                booking_id,
                spot_id,
                Ulid::new(),
                Ulid::new(),
                Span::new(now + 3_600_000, now + 7_200_000),
            )
            .await
            .unwrap();

        let deadline = engine.get_booking(booking_id).await.unwrap().pay_deadline;

        // Payment lands after collect but before the sweep's re-check
        engine.verify_payment(booking_id, owner).await.unwrap();
        assert!(!engine.expire_pending(booking_id, deadline + 60_000).await.unwrap());
        assert_eq!(
            engine.get_booking(booking_id).await.unwrap().status,
            BookingStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn reaper_collects_overdue_bookings() {
        let path = test_wal_path("reaper_overdue.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify, DEFAULT_PAYMENT_TIMEOUT_MS).unwrap());

        let owner = Ulid::new();
        let spot_id = Ulid::new();
        engine
            .create_spot(spot_id, owner, None, 1, 100, 0.0, 0.0)
            .await
            .unwrap();

        let now = now_ms();
        let booking_id = Ulid::new();
        engine
            .reserve(
                booking_id,
                spot_id,
                Ulid::new(),
                Ulid::new(),
                Span::new(now - 7_200_000, now - 3_600_000),
            )
            .await
            .unwrap();
        engine.verify_payment(booking_id, owner).await.unwrap();

        let overdue = engine.collect_overdue(now);
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].0, booking_id);

        engine.complete_booking(booking_id).await.unwrap();
        assert!(engine.collect_overdue(now).is_empty());
    }
}
