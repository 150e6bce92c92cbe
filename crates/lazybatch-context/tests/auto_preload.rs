//! Lazy preloading across registered record groups and the records their
//! batches produce.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier, OnceLock};
use std::thread;
use std::time::Duration;

use lazybatch_context::{AssociationTree, PreloadContextBuilder};
use lazybatch_core::{
    BoundArguments, DerivationRef, DerivationTable, EntityId, FnDerivation, Identify, Loadable,
    LoaderState, Preloader,
};
use parking_lot::Mutex;

#[derive(Default)]
struct Probe {
    calls: AtomicUsize,
    batches: Mutex<Vec<(&'static str, usize)>>,
}

impl Probe {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, derivation: &'static str, size: usize) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().push((derivation, size));
    }

    fn batch_sizes(&self, derivation: &str) -> Vec<usize> {
        self.batches
            .lock()
            .iter()
            .filter(|(name, _)| *name == derivation)
            .map(|(_, size)| *size)
            .collect()
    }
}

struct Node {
    weight: u32,
    kids: Vec<Arc<Node>>,
    probe: Arc<Probe>,
    loader: LoaderState<Node>,
}

impl Node {
    fn leaf(weight: u32, probe: &Arc<Probe>) -> Arc<Self> {
        Self::with_kids(weight, Vec::new(), probe)
    }

    fn with_kids(weight: u32, kids: Vec<Arc<Node>>, probe: &Arc<Probe>) -> Arc<Self> {
        Arc::new(Node {
            weight,
            kids,
            probe: Arc::clone(probe),
            loader: LoaderState::new(),
        })
    }

    /// Two roots with two leaves each.
    fn forest(probe: &Arc<Probe>) -> Vec<Arc<Self>> {
        (0..2)
            .map(|root| {
                let kids = vec![Node::leaf(root * 10 + 1, probe), Node::leaf(root * 10 + 2, probe)];
                Node::with_kids(root, kids, probe)
            })
            .collect()
    }
}

impl Identify for Node {
    fn entity_id(&self) -> EntityId {
        self.loader.id()
    }
}

impl Loadable for Node {
    fn loader_state(&self) -> &LoaderState<Self> {
        &self.loader
    }

    fn derivations(&self) -> &DerivationTable<Self> {
        static TABLE: OnceLock<DerivationTable<Node>> = OnceLock::new();
        TABLE.get_or_init(|| {
            DerivationTable::new()
                .define(
                    "children",
                    FnDerivation::<Node, Vec<Arc<Node>>>::batch("children", |nodes, _, out| {
                        nodes[0].probe.record("children", nodes.len());
                        for node in nodes {
                            out.record(node, node.kids.clone());
                        }
                        Ok(())
                    }),
                )
                .define(
                    "size",
                    FnDerivation::<Node, u32>::batch("size", |nodes, _, out| {
                        nodes[0].probe.record("size", nodes.len());
                        for node in nodes {
                            out.record(node, node.weight * 2);
                        }
                        Ok(())
                    }),
                )
        })
    }
}

fn doubled_weight() -> DerivationRef<Node> {
    DerivationRef::new(FnDerivation::<Node, u32>::batch("doubled_weight", |nodes, _, out| {
        nodes[0].probe.record("doubled_weight", nodes.len());
        for node in nodes {
            out.record(node, node.weight * 2);
        }
        Ok(())
    }))
}

fn size(node: &Arc<Node>) -> u32 {
    *node.load::<u32>("size", BoundArguments::new()).unwrap()
}

fn children(node: &Arc<Node>) -> Arc<Vec<Arc<Node>>> {
    node.load::<Vec<Arc<Node>>>("children", BoundArguments::new()).unwrap()
}

// ========== Auto preload ==========

#[test]
fn test_first_read_preloads_whole_context() {
    // Arrange
    let probe = Probe::new();
    let nodes: Vec<_> = (1..=3).map(|w| Node::leaf(w, &probe)).collect();
    let context = PreloadContextBuilder::new().auto_preload(true).register(&nodes);

    // Act
    let sizes: Vec<u32> = nodes.iter().rev().map(size).collect();

    // Assert
    assert_eq!(sizes, vec![6, 4, 2]);
    assert_eq!(probe.batch_sizes("size"), vec![3]);
    assert!(context.is_preloaded("size"));
}

#[test]
fn test_nested_records_batch_across_parents() {
    // Arrange
    let probe = Probe::new();
    let roots = Node::forest(&probe);
    PreloadContextBuilder::new().auto_preload(true).register(&roots);

    // Act
    let kids: Vec<Arc<Node>> = roots.iter().flat_map(|root| children(root).to_vec()).collect();
    let sizes: Vec<u32> = kids.iter().map(size).collect();

    // Assert
    assert_eq!(sizes, vec![2, 4, 22, 24]);
    assert_eq!(probe.batch_sizes("children"), vec![2]);
    assert_eq!(probe.batch_sizes("size"), vec![4]);
    assert!(kids.iter().all(|kid| kid.loader_state().has_first_access_hook()));
}

#[test]
fn test_records_without_context_compute_alone() {
    let probe = Probe::new();
    let nodes: Vec<_> = (1..=2).map(|w| Node::leaf(w, &probe)).collect();

    nodes.iter().for_each(|node| {
        size(node);
    });

    assert_eq!(probe.batch_sizes("size"), vec![1, 1]);
}

// ========== Explicit trees ==========

#[test]
fn test_explicit_tree_preloads_only_named_attributes() {
    // Arrange
    let probe = Probe::new();
    let roots = Node::forest(&probe);
    PreloadContextBuilder::new()
        .lazily("children", AssociationTree::from_names(["size"]))
        .register(&roots);

    // Act
    roots.iter().for_each(|root| {
        size(root);
    });
    let kids: Vec<Arc<Node>> = roots.iter().flat_map(|root| children(root).to_vec()).collect();
    kids.iter().for_each(|kid| {
        size(kid);
    });

    // Assert
    assert_eq!(probe.batch_sizes("children"), vec![2]);
    assert_eq!(probe.batch_sizes("size"), vec![1, 1, 4]);
}

#[test]
fn test_explicit_tree_stops_where_it_ends() {
    let probe = Probe::new();
    let roots = Node::forest(&probe);
    PreloadContextBuilder::new()
        .tree(AssociationTree::from_names(["children"]))
        .register(&roots);

    let kids = children(&roots[0]);
    kids.iter().for_each(|kid| {
        size(kid);
    });

    assert_eq!(probe.batch_sizes("children"), vec![2]);
    assert_eq!(probe.batch_sizes("size"), vec![1, 1]);
    assert!(!kids[0].loader_state().has_first_access_hook());
}

#[test]
fn test_existing_slots_survive_context_preload() {
    // Arrange
    let probe = Probe::new();
    let nodes: Vec<_> = (1..=3).map(|w| Node::leaf(w, &probe)).collect();
    size(&nodes[0]);
    let earlier = nodes[0].loader("size").unwrap();
    PreloadContextBuilder::new().auto_preload(true).register(&nodes);

    // Act
    size(&nodes[1]);
    size(&nodes[0]);

    // Assert
    assert!(Arc::ptr_eq(&nodes[0].loader("size").unwrap(), &earlier));
    assert_eq!(probe.batch_sizes("size"), vec![1, 2]);
}

// ========== Isolated loaders ==========

#[test]
fn test_isolated_loader_is_shared_across_context() {
    // Arrange
    let probe = Probe::new();
    let nodes: Vec<_> = (1..=3).map(|w| Node::leaf(w, &probe)).collect();
    PreloadContextBuilder::new().auto_preload(true).register(&nodes);
    let derivation = doubled_weight();

    // Act
    let values: Vec<u32> = nodes
        .iter()
        .map(|node| {
            *lazybatch_context::PreloadContext::load_isolated::<u32>(
                &derivation,
                node,
                BoundArguments::new(),
            )
            .unwrap()
        })
        .collect();

    // Assert
    assert_eq!(values, vec![2, 4, 6]);
    assert_eq!(probe.batch_sizes("doubled_weight"), vec![3]);
}

#[test]
fn test_isolated_loader_without_context_registers_one() {
    let probe = Probe::new();
    let node = Node::leaf(7, &probe);

    let value = lazybatch_context::PreloadContext::load_isolated::<u32>(
        &doubled_weight(),
        &node,
        BoundArguments::new(),
    )
    .unwrap();

    assert_eq!(*value, 14);
    assert!(node.loader_state().has_first_access_hook());
    assert_eq!(probe.batch_sizes("doubled_weight"), vec![1]);
}

// ========== Concurrency ==========

#[test]
fn test_concurrent_first_reads_share_one_preload() {
    // Arrange
    let probe = Probe::new();
    let nodes: Vec<_> = (0..8).map(|w| Node::leaf(w, &probe)).collect();
    let context = PreloadContextBuilder::new().auto_preload(true).register(&nodes);
    let barrier = Barrier::new(nodes.len());

    // Act
    std::thread::scope(|scope| {
        for node in &nodes {
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                assert_eq!(size(node), node.weight * 2);
            });
        }
    });

    // Assert
    assert_eq!(probe.batch_sizes("size"), vec![8]);
    assert!(context.is_preloaded("size"));
}

#[test]
fn test_followers_see_nested_records_already_registered() {
    // Arrange
    let probe = Probe::new();
    let roots: Vec<_> = (0..4)
        .map(|root| {
            let kids = vec![Node::leaf(root * 10 + 1, &probe), Node::leaf(root * 10 + 2, &probe)];
            Node::with_kids(root, kids, &probe)
        })
        .collect();
    PreloadContextBuilder::new().auto_preload(true).register(&roots);
    let barrier = Barrier::new(roots.len());

    // Act
    thread::scope(|scope| {
        for root in &roots {
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for kid in children(root).iter() {
                    assert!(kid.loader_state().has_first_access_hook());
                    size(kid);
                }
            });
        }
    });

    // Assert
    assert_eq!(probe.batch_sizes("children"), vec![4]);
    assert_eq!(probe.batch_sizes("size"), vec![8]);
}

// ========== Lock ordering ==========

/// Record whose "slow" body reads "size" on a peer while its unit is held.
struct Job {
    weight: u32,
    peer: OnceLock<Arc<Job>>,
    loader: LoaderState<Job>,
}

impl Job {
    fn new(weight: u32) -> Arc<Self> {
        Arc::new(Job {
            weight,
            peer: OnceLock::new(),
            loader: LoaderState::new(),
        })
    }
}

impl Identify for Job {
    fn entity_id(&self) -> EntityId {
        self.loader.id()
    }
}

impl Loadable for Job {
    fn loader_state(&self) -> &LoaderState<Self> {
        &self.loader
    }

    fn derivations(&self) -> &DerivationTable<Self> {
        static TABLE: OnceLock<DerivationTable<Job>> = OnceLock::new();
        TABLE.get_or_init(|| {
            DerivationTable::new()
                .define(
                    "slow",
                    FnDerivation::<Job, u32>::batch("slow", |jobs, _, out| {
                        for job in jobs {
                            let extra = match job.peer.get() {
                                Some(peer) => {
                                    thread::sleep(Duration::from_millis(200));
                                    *peer.load::<u32>("size", BoundArguments::new())?
                                }
                                None => 0,
                            };
                            out.record(job, job.weight + extra);
                        }
                        Ok(())
                    }),
                )
                .define(
                    "size",
                    FnDerivation::<Job, u32>::batch("size", |jobs, _, out| {
                        for job in jobs {
                            out.record(job, job.weight * 2);
                        }
                        Ok(())
                    }),
                )
        })
    }
}

#[test]
fn test_preload_does_not_wait_on_running_batches() {
    // Arrange
    let running = Job::new(1);
    let peer = Job::new(5);
    let other = Job::new(3);
    assert!(running.peer.set(Arc::clone(&peer)).is_ok());
    Preloader::new([Arc::clone(&running)]).preload(&["slow"]);
    PreloadContextBuilder::new()
        .auto_preload(true)
        .register(&[Arc::clone(&running), Arc::clone(&peer), Arc::clone(&other)]);
    let (sender, finished) = mpsc::channel();

    // Act
    let computing = sender.clone();
    let job = Arc::clone(&running);
    thread::spawn(move || {
        let value = job.load::<u32>("slow", BoundArguments::new()).map(|v| *v);
        let _ = computing.send(("running", value));
    });
    thread::sleep(Duration::from_millis(50));
    let job = Arc::clone(&other);
    thread::spawn(move || {
        let value = job.load::<u32>("slow", BoundArguments::new()).map(|v| *v);
        let _ = sender.send(("other", value));
    });

    // Assert
    let mut results: Vec<(&str, u32)> = (0..2)
        .map(|_| {
            let (name, value) = finished
                .recv_timeout(Duration::from_secs(5))
                .expect("both reads finish");
            (name, value.unwrap())
        })
        .collect();
    results.sort();
    assert_eq!(results, vec![("other", 3), ("running", 11)]);
}
