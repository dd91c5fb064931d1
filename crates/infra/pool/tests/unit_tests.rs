//! Unit tests for pool building blocks

mod config_tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use shardpool::{PoolConfig, PoolError};

    #[test]
    fn test_default_config_is_valid() {
        let config = PoolConfig::default();
        assert_eq!(config.initial_segment_capacity, 8);
        assert_eq!(config.max_segment_capacity, 1 << 30);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case(1, 1)] // Smallest chain
    #[case(2, 1024)] // Typical
    #[case(1 << 30, 1 << 30)] // At the limit
    fn test_valid_configs(#[case] initial: usize, #[case] max: usize) {
        let config = PoolConfig {
            initial_segment_capacity: initial,
            max_segment_capacity: max,
        };
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case(0, 8)] // Zero is not a power of two
    #[case(3, 8)] // Odd size
    #[case(8, 100)] // Bad maximum
    fn test_non_power_of_two_rejected(#[case] initial: usize, #[case] max: usize) {
        let config = PoolConfig {
            initial_segment_capacity: initial,
            max_segment_capacity: max,
        };
        assert!(matches!(
            config.validate(),
            Err(PoolError::NotPowerOfTwo { .. })
        ));
    }

    #[test]
    fn test_capacity_above_limit_rejected() {
        let config = PoolConfig {
            initial_segment_capacity: 8,
            max_segment_capacity: 1 << 31,
        };
        assert!(matches!(
            config.validate(),
            Err(PoolError::CapacityTooLarge {
                capacity,
                limit,
            }) if capacity == 1 << 31 && limit == 1 << 30
        ));
    }

    #[test]
    fn test_initial_above_max_rejected() {
        let config = PoolConfig {
            initial_segment_capacity: 64,
            max_segment_capacity: 16,
        };
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Initial segment capacity 64 exceeds maximum 16"
        );
    }

    #[test]
    fn test_serde_round_trip() -> anyhow::Result<()> {
        let config = PoolConfig {
            initial_segment_capacity: 16,
            max_segment_capacity: 4096,
        };
        let json = serde_json::to_string(&config)?;
        let back: PoolConfig = serde_json::from_str(&json)?;
        assert_eq!(back, config);
        Ok(())
    }

    #[test]
    fn test_partial_config_uses_defaults() -> anyhow::Result<()> {
        let config: PoolConfig = serde_json::from_str(r#"{"max_segment_capacity": 256}"#)?;
        assert_eq!(config.initial_segment_capacity, 8);
        assert_eq!(config.max_segment_capacity, 256);
        Ok(())
    }
}

mod ring_tests {
    use rstest::rstest;
    use shardpool::{PoolError, Ring};

    #[rstest]
    #[case(1)]
    #[case(8)]
    #[case(64)]
    fn test_ring_fills_to_capacity(#[case] capacity: usize) {
        let ring = Ring::with_capacity(capacity).unwrap();
        for i in 0..capacity {
            // SAFETY: single producer
            assert!(unsafe { ring.push_head(i) }.is_ok());
        }
        assert_eq!(ring.len(), capacity);
        // SAFETY: single producer
        assert_eq!(unsafe { ring.push_head(capacity) }, Err(capacity));

        assert_eq!(ring.pop_tail(), Some(0));
        // SAFETY: single producer
        assert!(unsafe { ring.push_head(capacity) }.is_ok());
    }

    #[rstest]
    #[case(0)]
    #[case(6)]
    #[case(1 << 31)]
    fn test_ring_rejects_bad_capacity(#[case] capacity: usize) {
        let err = Ring::<u8>::with_capacity(capacity).unwrap_err();
        assert!(matches!(
            err,
            PoolError::NotPowerOfTwo { .. } | PoolError::CapacityTooLarge { .. }
        ));
    }

    #[test]
    fn test_ring_head_and_tail_order() {
        let ring = Ring::with_capacity(8).unwrap();
        for i in 1..=4 {
            // SAFETY: single producer
            unsafe { ring.push_head(i) }.unwrap();
        }
        // SAFETY: single producer
        assert_eq!(unsafe { ring.pop_head() }, Some(4));
        assert_eq!(ring.pop_tail(), Some(1));
        assert_eq!(ring.pop_tail(), Some(2));
        // SAFETY: single producer
        assert_eq!(unsafe { ring.pop_head() }, Some(3));
        assert!(ring.is_empty());
    }
}

mod chain_tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use shardpool::{Chain, PoolConfig};

    #[rstest]
    #[case(1, 4, 10, vec![1, 2, 4, 4])] // Hits the cap
    #[case(8, 1024, 8, vec![8])] // Fits in the first segment
    #[case(8, 1024, 9, vec![8, 16])] // Spills once
    fn test_chain_growth(
        #[case] initial: usize,
        #[case] max: usize,
        #[case] pushes: usize,
        #[case] expected: Vec<usize>,
    ) {
        let chain = Chain::with_config(&PoolConfig {
            initial_segment_capacity: initial,
            max_segment_capacity: max,
        })
        .unwrap();
        for i in 0..pushes {
            // SAFETY: single producer
            unsafe { chain.push_head(i) };
        }
        assert_eq!(chain.segment_capacities(), expected);

        let drained: Vec<usize> = std::iter::from_fn(|| chain.pop_tail()).collect();
        assert_eq!(drained, (0..pushes).collect::<Vec<_>>());
    }

    #[test]
    fn test_chain_rejects_invalid_config() {
        let result = Chain::<u8>::with_config(&PoolConfig {
            initial_segment_capacity: 32,
            max_segment_capacity: 8,
        });
        assert!(result.is_err());
    }
}

mod pinner_tests {
    use shardpool::{ManualPinner, Pinner, PoolError, ThreadPinner};

    #[test]
    fn test_manual_pinner_requires_workers() {
        assert!(matches!(ManualPinner::new(0), Err(PoolError::NoWorkers)));
    }

    #[test]
    fn test_manual_pinner_bounds() {
        let pinner = ManualPinner::new(2).unwrap();
        let err = pinner.bind_current_thread(5).unwrap_err();
        assert_eq!(err.to_string(), "Worker index 5 out of range for 2 workers");
        assert_eq!(pinner.current(), None);

        pinner.bind_current_thread(1).unwrap();
        assert_eq!(pinner.current(), Some(1));
        assert_eq!(pinner.pin(), 1);
        pinner.unpin();
    }

    #[test]
    fn test_thread_pinner_index_in_range() {
        let pinner = ThreadPinner;
        assert!(pinner.workers() >= 1);
        let index = pinner.pin();
        assert!(index < pinner.workers());
        pinner.unpin();
    }
}
