use std::collections::HashMap;

use proptest::prelude::*;
use vecagent::kvs::CowMap;

#[derive(Clone, Debug)]
enum Op {
    Store(u8, u32),
    Load(u8),
    Delete(u8),
    DeleteIfEven(u8),
    Range,
}

fn op() -> impl Strategy<Value = Op> {
    let key = 0u8..32;
    prop_oneof![
        4 => (key.clone(), any::<u32>()).prop_map(|(k, v)| Op::Store(k, v)),
        3 => key.clone().prop_map(Op::Load),
        2 => key.clone().prop_map(Op::Delete),
        2 => key.prop_map(Op::DeleteIfEven),
        1 => Just(Op::Range),
    ]
}

fn snapshot(map: &CowMap<u8, u32>) -> HashMap<u8, u32> {
    let mut seen = HashMap::new();
    map.range(|k, v| {
        assert!(seen.insert(*k, v).is_none(), "key {k} visited twice");
        true
    });
    seen
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn cow_map_matches_hashmap(ops in prop::collection::vec(op(), 1..200)) {
        let map = CowMap::new();
        let mut model: HashMap<u8, u32> = HashMap::new();

        for op in ops {
            match op {
                Op::Store(k, v) => {
                    prop_assert_eq!(map.store(k, v), model.insert(k, v));
                }
                Op::Load(k) => {
                    prop_assert_eq!(map.load(&k), model.get(&k).copied());
                }
                Op::Delete(k) => {
                    prop_assert_eq!(map.delete(&k), model.remove(&k));
                }
                Op::DeleteIfEven(k) => {
                    let expected = match model.get(&k) {
                        Some(v) if v % 2 == 0 => model.remove(&k),
                        _ => None,
                    };
                    prop_assert_eq!(map.delete_if(&k, |v| v % 2 == 0), expected);
                }
                Op::Range => {
                    prop_assert_eq!(snapshot(&map), model.clone());
                }
            }
        }

        prop_assert_eq!(snapshot(&map), model);
    }

    #[test]
    fn range_stops_when_asked(n in 1usize..40, stop_after in 1usize..10) {
        let map = CowMap::new();
        for i in 0..n {
            map.store(i, i);
        }
        let mut visited = 0;
        map.range(|_, _| {
            visited += 1;
            visited < stop_after
        });
        prop_assert_eq!(visited, n.min(stop_after));
    }
}
