//! Tests for the expiring store.

use super::*;

mod reads {
    use super::*;

    /// Verify a value can be stored and retrieved before it expires.
    #[tokio::test(start_paused = true)]
    async fn test_set_and_get() {
        let store: ExpiringStore<String, u32> = ExpiringStore::new();

        store.set("token".to_string(), 7, Duration::from_secs(30));

        assert_eq!(store.get(&"token".to_string()), Some(7));
        assert!(store.has(&"token".to_string()));
        assert!(!store.has(&"other".to_string()));
    }

    /// Verify an expired entry reads as absent even though no sweep has run.
    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reads_absent_before_sweep() {
        let store: ExpiringStore<&'static str, u32> = ExpiringStore::new();
        store.set("token", 1, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(store.get(&"token"), None);
        assert!(!store.has(&"token"));
        assert_eq!(store.stored_len(), 1, "entry is still physically present");
    }

    /// Verify set on an existing key resets the expiry from the call time.
    #[tokio::test(start_paused = true)]
    async fn test_set_resets_expiry() {
        let store: ExpiringStore<&'static str, u32> = ExpiringStore::new();
        store.set("token", 1, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(8)).await;
        store.set("token", 2, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.get(&"token"), Some(2));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get(&"token"), None);
    }

    /// Verify remove returns live values only.
    #[tokio::test(start_paused = true)]
    async fn test_remove() {
        let store: ExpiringStore<&'static str, u32> = ExpiringStore::new();
        store.set("live", 1, Duration::from_secs(10));
        store.set("stale", 2, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.remove(&"live"), Some(1));
        assert_eq!(store.remove(&"stale"), None);
        assert_eq!(store.stored_len(), 0);
    }
}

mod sweeping {
    use super::*;

    /// Verify an explicit sweep removes only expired entries.
    #[tokio::test(start_paused = true)]
    async fn test_manual_sweep() {
        let store: ExpiringStore<u32, u32> = ExpiringStore::new();
        store.set(1, 1, Duration::from_secs(5));
        store.set(2, 2, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.stored_len(), 1);
        assert_eq!(store.get(&2), Some(2));
    }

    /// Verify the background sweep removes expired entries without reads.
    #[tokio::test(start_paused = true)]
    async fn test_background_sweep() {
        let store: ExpiringStore<u32, u32> = ExpiringStore::with_sweep(Duration::from_secs(30));
        store.set(1, 1, Duration::from_secs(5));
        store.set(2, 2, Duration::from_secs(120));

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(store.stored_len(), 1);
        assert_eq!(store.get(&2), Some(2));
    }
}
