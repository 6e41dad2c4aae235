//! Randomized whole-heap property test: after a collection, the surviving
//! objects are exactly the transitive closure of the roots, survivors are
//! left unmarked, and everything else has been finalized.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use pmcs::api;
use pmcs::heap::{ObjRef, ObjectFactory, TypeInfo};
use pmcs::util::logger;
use pmcs::PMCS;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NODES: usize = 300;
const SLOTS: &[usize] = &[0, 8, 16, 24];

fn transitive_closure(edges: &[Vec<usize>], roots: &[usize]) -> HashSet<usize> {
    let mut reachable: HashSet<usize> = HashSet::new();
    let mut worklist: Vec<usize> = roots.to_vec();
    while let Some(node) = worklist.pop() {
        if reachable.insert(node) {
            worklist.extend(edges[node].iter().copied());
        }
    }
    reachable
}

#[test]
fn survivors_equal_transitive_closure_of_roots() {
    logger::try_init();
    let mut builder = PMCS::<ObjectFactory>::builder();
    assert!(builder.set_option("threads", "2"));
    let pmcs: PMCS<ObjectFactory> = builder.build();

    let finalized: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));
    let mutator = pmcs.register_current_thread();

    // Every node gets its own type so its finalizer can report which node
    // died.
    let objs: Vec<ObjRef> = (0..NODES)
        .map(|i| {
            let finalized = finalized.clone();
            let ty = TypeInfo::object("GraphNode", 32, SLOTS)
                .with_finalizer(Arc::new(move |_| {
                    finalized.lock().unwrap().insert(i);
                }))
                .leak();
            api::create_object(&mutator, ty)
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(0x9e37_79b9);
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); NODES];
    for (i, obj) in objs.iter().enumerate() {
        for &offset in SLOTS {
            if rng.gen_bool(0.6) {
                let j = rng.gen_range(0..NODES);
                obj.store_field(offset, Some(objs[j]));
                edges[i].push(j);
            }
        }
    }

    // Half of the roots on the mutator's shadow stack, half global.
    let mut roots: Vec<usize> = Vec::new();
    while roots.len() < 12 {
        let r = rng.gen_range(0..NODES);
        if !roots.contains(&r) {
            roots.push(r);
        }
    }
    for (k, &r) in roots.iter().enumerate() {
        if k % 2 == 0 {
            mutator.push_root(objs[r]);
        } else {
            pmcs.add_global_root(objs[r]);
        }
    }
    let expected = transitive_closure(&edges, &roots);

    let epoch = mutator.schedule();
    mutator.wait_finalizers(epoch);

    {
        let dead = finalized.lock().unwrap();
        for i in 0..NODES {
            if expected.contains(&i) {
                assert!(!dead.contains(&i), "live node {} was finalized", i);
                // Survivors are white again for the next epoch.
                assert!(!objs[i].is_marked(), "live node {} still marked", i);
            } else {
                assert!(dead.contains(&i), "dead node {} was not finalized", i);
            }
        }
    }
    assert_eq!(pmcs.allocator().published_object_count(), expected.len());

    // A second collection over the unchanged graph reclaims nothing new.
    let epoch = mutator.schedule();
    mutator.wait_finalizers(epoch);
    assert_eq!(finalized.lock().unwrap().len(), NODES - expected.len());
    assert_eq!(pmcs.allocator().published_object_count(), expected.len());

    drop(mutator);
}
