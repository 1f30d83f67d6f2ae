use crate::address::Address;

/// One occupied queue slot, ranked by recency.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub address: Address,
    /// 1 is the most recent entry.
    pub rank: usize,
    pub is_viewer: bool,
    /// Index of the slot in the ledger's array.
    pub slot: usize,
}

/// Projects raw queue slots into display order, most recently filled first.
///
/// Empty slots are dropped. Address equality is byte equality, so the viewer match is
/// insensitive to the case of whatever text the addresses were parsed from.
pub fn project(queue: &[Address], viewer: Option<&Address>) -> Vec<QueueEntry> {
    let occupied: Vec<(usize, Address)> = queue
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, address)| !address.is_zero())
        .collect();
    occupied
        .into_iter()
        .rev()
        .enumerate()
        .map(|(display_index, (slot, address))| QueueEntry {
            address,
            rank: display_index + 1,
            is_viewer: viewer.is_some_and(|v| *v == address),
            slot,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    fn addr(byte: u8) -> Address {
        Address::new([byte; 20])
    }

    #[test]
    fn project__marks_viewer_regardless_of_case() {
        // given
        let aaa = Address::from_str("0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        let bbb = Address::from_str("0xBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB").unwrap();
        let queue = [Address::ZERO, Address::ZERO, aaa, bbb];
        let viewer = Address::from_str("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb").unwrap();

        // when
        let entries = project(&queue, Some(&viewer));

        // then
        assert_eq!(
            entries,
            vec![
                QueueEntry {
                    address: bbb,
                    rank: 1,
                    is_viewer: true,
                    slot: 3,
                },
                QueueEntry {
                    address: aaa,
                    rank: 2,
                    is_viewer: false,
                    slot: 2,
                },
            ]
        );
    }

    #[test]
    fn project__empty_queue_yields_nothing() {
        let queue = vec![Address::ZERO; 100];
        assert!(project(&queue, Some(&addr(1))).is_empty());
    }

    #[test]
    fn project__without_viewer_marks_no_one() {
        let queue = [addr(1), addr(2), Address::ZERO];
        let entries = project(&queue, None);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| !e.is_viewer));
        assert_eq!(entries[0].address, addr(2));
    }

    #[test]
    fn project__is_restartable() {
        let queue = [addr(3), Address::ZERO, addr(4)];
        assert_eq!(project(&queue, None), project(&queue, None));
    }

    fn queue_strategy() -> impl Strategy<Value = Vec<Address>> {
        prop::collection::vec(
            prop_oneof![Just(Address::ZERO), any::<[u8; 20]>().prop_map(Address::new)],
            0..120,
        )
    }

    proptest! {
        #[test]
        fn project__ranks_are_contiguous_and_bounded(queue in queue_strategy()) {
            let entries = project(&queue, None);
            let occupied = queue.iter().filter(|a| !a.is_zero()).count();

            prop_assert_eq!(entries.len(), occupied);
            let mut ranks: Vec<usize> = entries.iter().map(|e| e.rank).collect();
            ranks.sort_unstable();
            prop_assert_eq!(ranks, (1..=occupied).collect::<Vec<_>>());
        }

        #[test]
        fn project__most_recent_slot_ranks_first(queue in queue_strategy()) {
            let entries = project(&queue, None);
            let slots: Vec<usize> = entries.iter().map(|e| e.slot).collect();
            prop_assert!(slots.windows(2).all(|w| w[0] > w[1]));
            if let Some(first) = entries.first() {
                prop_assert_eq!(first.rank, 1);
                prop_assert_eq!(entries.last().map(|e| e.rank), Some(entries.len()));
            }
        }
    }
}
