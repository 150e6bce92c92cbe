//! Shared fixtures for the integration suite.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use lazybatch_core::{
    DerivationRef, DerivationTable, EntityId, FnDerivation, Identify, Loadable, LoaderError,
    LoaderState,
};
use parking_lot::Mutex;

/// Observes the computations of one test's entities.
#[derive(Default)]
pub struct Probe {
    calls: AtomicUsize,
    batches: Mutex<Vec<usize>>,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn observe(&self, batch_size: usize) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().push(batch_size);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }
}

pub struct User {
    pub name: String,
    probe: Arc<Probe>,
    loader: LoaderState<User>,
}

impl User {
    pub fn new(name: &str, probe: &Arc<Probe>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            probe: Arc::clone(probe),
            loader: LoaderState::new(),
        })
    }

    pub fn many(names: &[&str], probe: &Arc<Probe>) -> Vec<Arc<Self>> {
        names.iter().map(|name| User::new(name, probe)).collect()
    }
}

impl Identify for User {
    fn entity_id(&self) -> EntityId {
        self.loader.id()
    }
}

impl Loadable for User {
    fn loader_state(&self) -> &LoaderState<Self> {
        &self.loader
    }

    fn derivations(&self) -> &DerivationTable<Self> {
        static TABLE: OnceLock<DerivationTable<User>> = OnceLock::new();
        TABLE.get_or_init(user_table)
    }
}

fn user_table() -> DerivationTable<User> {
    DerivationTable::new()
        .define(
            "echo",
            FnDerivation::<User, Vec<EntityId>>::batch("echo", |users, _, out| {
                users[0].probe.observe(users.len());
                for user in users {
                    out.record(user, vec![user.entity_id()]);
                }
                Ok(())
            }),
        )
        .define(
            "tagged",
            FnDerivation::<User, (EntityId, String)>::builder("tagged")
                .required("something")
                .perform(|users, args, out| {
                    users[0].probe.observe(users.len());
                    let something = args
                        .get::<String>("something")
                        .map(|s| String::clone(&s))
                        .unwrap_or_default();
                    for user in users {
                        out.record(user, (user.entity_id(), something.clone()));
                    }
                    Ok(())
                })
                .build(),
        )
        .define(
            "greeting",
            FnDerivation::<User, String>::builder("greeting")
                .with_default("prefix", || "hello".to_string())
                .perform(|users, args, out| {
                    users[0].probe.observe(users.len());
                    let prefix = args.get::<String>("prefix").map(|p| String::clone(&p));
                    for user in users {
                        out.record(
                            user,
                            format!("{} {}", prefix.as_deref().unwrap_or("hi"), user.name),
                        );
                    }
                    Ok(())
                })
                .build(),
        )
        .define(
            "failing",
            FnDerivation::<User, u32>::batch("failing", |users, _, _| {
                users[0].probe.observe(users.len());
                Err(LoaderError::failed("failing", "upstream timed out"))
            }),
        )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Square,
    Circle,
}

/// Entity type whose declarations depend on its kind.
pub struct Shape {
    pub kind: Kind,
    pub size: u32,
    probe: Arc<Probe>,
    loader: LoaderState<Shape>,
}

impl Shape {
    pub fn new(kind: Kind, size: u32, probe: &Arc<Probe>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            size,
            probe: Arc::clone(probe),
            loader: LoaderState::new(),
        })
    }
}

impl Identify for Shape {
    fn entity_id(&self) -> EntityId {
        self.loader.id()
    }
}

impl Loadable for Shape {
    fn loader_state(&self) -> &LoaderState<Self> {
        &self.loader
    }

    fn derivations(&self) -> &DerivationTable<Self> {
        static SQUARES: OnceLock<DerivationTable<Shape>> = OnceLock::new();
        static CIRCLES: OnceLock<DerivationTable<Shape>> = OnceLock::new();
        match self.kind {
            Kind::Square => SQUARES.get_or_init(|| {
                DerivationTable::inherit(shape_base()).define("area", area("square_area", 1))
            }),
            Kind::Circle => CIRCLES.get_or_init(|| {
                DerivationTable::inherit(shape_base())
                    .define("area", area("circle_area", 3))
                    .define("label", label("circle_label"))
            }),
        }
    }
}

/// Declarations every shape kind starts from.
pub fn shape_base() -> &'static DerivationTable<Shape> {
    static BASE: OnceLock<DerivationTable<Shape>> = OnceLock::new();
    BASE.get_or_init(|| {
        DerivationTable::new()
            .define_shared("perimeter", shared_perimeter().clone())
            .define("label", label("shape_label"))
    })
}

/// One handle shared by every shape kind.
pub fn shared_perimeter() -> &'static DerivationRef<Shape> {
    static PERIMETER: OnceLock<DerivationRef<Shape>> = OnceLock::new();
    PERIMETER.get_or_init(|| {
        DerivationRef::new(FnDerivation::<Shape, u32>::batch("perimeter", |shapes, _, out| {
            shapes[0].probe.observe(shapes.len());
            for shape in shapes {
                out.record(shape, shape.size * 4);
            }
            Ok(())
        }))
    })
}

fn area(name: &'static str, factor: u32) -> FnDerivation<Shape, u32> {
    FnDerivation::<Shape, u32>::batch(name, move |shapes, _, out| {
        shapes[0].probe.observe(shapes.len());
        for shape in shapes {
            out.record(shape, shape.size * shape.size * factor);
        }
        Ok(())
    })
}

fn label(name: &'static str) -> FnDerivation<Shape, String> {
    FnDerivation::<Shape, String>::batch(name, move |shapes, _, out| {
        for shape in shapes {
            out.record(shape, format!("{name}:{}", shape.size));
        }
        Ok(())
    })
}
