//! Property tests over generated block trees and delivery orders.
//!
//! - Every node reachable from a chain view sits one above its parent.
//! - `find_fork` is symmetric between two branches sharing a prefix.
//! - Any delivery order of a valid chain ends on the same tip.
//! - A reorganization detaches exactly the old-only suffix.

use std::sync::Arc;

use proptest::prelude::*;

use tessera_chain::ChainEvent;
use tessera_core::block_index::BlockIndex;
use tessera_core::chain_view::ChainView;
use tessera_tests::helpers::*;

// ---------------------------------------------------------------------------
// Chain view
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn height_invariant_holds_for_any_tip(
        growth in prop::collection::vec((any::<prop::sample::Index>(), 1usize..8), 1..12),
        tip_pick in any::<prop::sample::Index>(),
        retarget in any::<prop::sample::Index>(),
    ) {
        let index = Arc::new(BlockIndex::new());
        let mut all = vec![genesis(&index)];
        for (salt, (from, len)) in growth.into_iter().enumerate() {
            let base = all[from.index(all.len())].clone();
            all.extend(branch(&index, &base, len, salt as u64));
        }

        let view = ChainView::new(index.clone(), Some(all[tip_pick.index(all.len())].clone()));
        // Moving the tip reuses slots; the invariant must survive it.
        view.set_tip(&all[retarget.index(all.len())]);

        for (h, node) in view.nodes().iter().enumerate() {
            prop_assert_eq!(node.height(), h as u64);
            match index.parent(node) {
                Some(parent) => prop_assert_eq!(parent.height() + 1, node.height()),
                None => prop_assert_eq!(node.height(), 0),
            }
            prop_assert!(view.contains(node));
        }
    }

    #[test]
    fn find_fork_is_symmetric(shared in 0usize..20, a_len in 1usize..15, b_len in 1usize..15) {
        let index = Arc::new(BlockIndex::new());
        let root = genesis(&index);
        let prefix = branch(&index, &root, shared, 0);
        let fork_point = prefix.last().cloned().unwrap_or_else(|| root.clone());
        let a = branch(&index, &fork_point, a_len, 1);
        let b = branch(&index, &fork_point, b_len, 2);
        let (tip_a, tip_b) = (a[a_len - 1].clone(), b[b_len - 1].clone());

        let view_a = ChainView::new(index.clone(), Some(tip_a.clone()));
        let view_b = ChainView::new(index.clone(), Some(tip_b.clone()));
        let from_a = view_a.find_fork(&tip_b).map(|n| n.hash());
        let from_b = view_b.find_fork(&tip_a).map(|n| n.hash());

        prop_assert_eq!(from_a, Some(fork_point.hash()));
        prop_assert_eq!(from_a, from_b);
    }
}

// ---------------------------------------------------------------------------
// Chain service
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_delivery_order_reaches_the_same_tip(order in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle()) {
        let source = dev_service();
        let blocks = extend(&source, 8, 0);

        let target = dev_service();
        for i in order {
            target.process_block(blocks[i].clone()).unwrap();
        }
        prop_assert_eq!(target.orphan_count(), 0);
        prop_assert!(same_main_chain(&source, &target));
    }

    #[test]
    fn reorg_detaches_exactly_the_old_suffix(shared in 0usize..6, old_len in 1usize..5, extra in 1usize..4) {
        let local = dev_service();
        let remote = dev_service();
        let prefix = extend(&local, shared, 0);
        deliver(&remote, &prefix);
        let old = extend(&local, old_len, 0);
        let new = extend(&remote, old_len + extra, 3);

        let mut events = local.subscribe();
        deliver(&local, &new);
        prop_assert!(same_main_chain(&local, &remote));

        let mut detached = Vec::new();
        let mut attached = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                ChainEvent::Detached { hash, .. } => detached.push(hash),
                ChainEvent::Attached { hash, .. } => attached.push(hash),
            }
        }
        let expected: Vec<_> = old.iter().rev().map(|b| b.hash()).collect();
        prop_assert_eq!(detached, expected);
        let new_hashes: Vec<_> = new.iter().map(|b| b.hash()).collect();
        prop_assert_eq!(attached, new_hashes);
    }
}
