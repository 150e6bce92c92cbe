//! Argument declarations, validation and the accessor view handed to
//! derivation bodies.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::key::CacheKey;
use super::value::{ArgValue, BoundArguments};
use crate::error::{Arity, LoaderError, LoaderResult};

/// Supplier of a default argument value.
pub type DefaultFn = Arc<dyn Fn() -> ArgValue + Send + Sync>;

/// One named input of a derivation.
#[derive(Clone)]
pub struct ArgumentDescriptor {
    name: String,
    required: bool,
    default: Option<DefaultFn>,
}

impl ArgumentDescriptor {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            default: None,
        }
    }

    /// An argument with a default is always optional. Defaults are not part
    /// of the default cache key.
    pub fn with_default<T, F>(name: impl Into<String>, supplier: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            required: false,
            default: Some(Arc::new(move || ArgValue::new(supplier()))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

impl fmt::Debug for ArgumentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentDescriptor")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

/// Ordered argument declarations of a derivation.
///
/// # Example
///
/// ```
/// use lazybatch_core::{ArgumentSchema, BoundArguments};
///
/// let schema = ArgumentSchema::new()
///     .required("from")
///     .required("to")
///     .with_default("currency", || "EUR".to_string());
///
/// let bound = BoundArguments::new().with("from", 1).with("to", 2);
/// assert!(schema.check("payments_total", &bound).is_ok());
/// assert!(schema.check("payments_total", &BoundArguments::new()).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ArgumentSchema {
    descriptors: Vec<ArgumentDescriptor>,
}

static EMPTY_SCHEMA: ArgumentSchema = ArgumentSchema::new();

impl ArgumentSchema {
    pub const fn new() -> Self {
        Self {
            descriptors: Vec::new(),
        }
    }

    /// Schema of a derivation that takes no arguments.
    pub fn empty() -> &'static ArgumentSchema {
        &EMPTY_SCHEMA
    }

    /// Adds a declaration. Redeclaring a name replaces it in place.
    pub fn argument(mut self, descriptor: ArgumentDescriptor) -> Self {
        match self
            .descriptors
            .iter_mut()
            .find(|existing| existing.name == descriptor.name)
        {
            Some(existing) => *existing = descriptor,
            None => self.descriptors.push(descriptor),
        }
        self
    }

    pub fn required(self, name: impl Into<String>) -> Self {
        self.argument(ArgumentDescriptor::required(name))
    }

    pub fn optional(self, name: impl Into<String>) -> Self {
        self.argument(ArgumentDescriptor::optional(name))
    }

    pub fn with_default<T, F>(self, name: impl Into<String>, supplier: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.argument(ArgumentDescriptor::with_default(name, supplier))
    }

    pub fn descriptors(&self) -> &[ArgumentDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, name: &str) -> Option<&ArgumentDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn arity(&self) -> Arity {
        Arity {
            min: self.descriptors.iter().filter(|d| d.required).count(),
            max: self.descriptors.len(),
        }
    }

    /// Validates `bound` against the declarations.
    ///
    /// Missing required arguments are reported before unknown ones.
    pub fn check(&self, derivation: &str, bound: &BoundArguments) -> LoaderResult<()> {
        let missing: Vec<String> = self
            .descriptors
            .iter()
            .filter(|d| d.required && !bound.contains(&d.name))
            .map(|d| d.name.clone())
            .collect();

        if !missing.is_empty() {
            return Err(LoaderError::MissingArgument {
                derivation: derivation.to_string(),
                arity: self.arity(),
                given: bound.len(),
                missing,
            });
        }

        let mut unknown: Vec<&str> = bound
            .names()
            .filter(|name| self.descriptor(name).is_none())
            .collect();
        unknown.sort_unstable();

        if let Some(argument) = unknown.first() {
            return Err(LoaderError::InvalidArgument {
                derivation: derivation.to_string(),
                argument: (*argument).to_string(),
            });
        }

        Ok(())
    }

    /// Binds values to declarations by position.
    pub fn bind_positional(
        &self,
        derivation: &str,
        values: impl IntoIterator<Item = ArgValue>,
    ) -> LoaderResult<BoundArguments> {
        let mut bound = BoundArguments::new();
        for (index, value) in values.into_iter().enumerate() {
            let Some(descriptor) = self.descriptors.get(index) else {
                return Err(LoaderError::InvalidArgument {
                    derivation: derivation.to_string(),
                    argument: format!("<positional {index}>"),
                });
            };
            bound.insert(descriptor.name.clone(), value);
        }
        Ok(bound)
    }
}

/// Read access to the arguments of one batch unit.
///
/// Supplied values win; otherwise the declared default is produced on first
/// access and memoized for the lifetime of the unit.
pub struct Arguments {
    schema: ArgumentSchema,
    supplied: BoundArguments,
    defaults: Mutex<HashMap<String, ArgValue>>,
}

impl Arguments {
    pub fn new(schema: &ArgumentSchema, supplied: BoundArguments) -> Self {
        Self {
            schema: schema.clone(),
            supplied,
            defaults: Mutex::new(HashMap::new()),
        }
    }

    pub fn supplied(&self) -> &BoundArguments {
        &self.supplied
    }

    pub fn schema(&self) -> &ArgumentSchema {
        &self.schema
    }

    /// Supplied value, else the memoized default. `None` for absent optional
    /// arguments and undeclared names.
    pub fn value(&self, name: &str) -> Option<ArgValue> {
        if let Some(value) = self.supplied.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.defaults.lock().get(name) {
            return Some(value.clone());
        }

        let supplier = self.schema.descriptor(name)?.default.clone()?;
        // The supplier runs unlocked; if two readers race, the first
        // inserted value wins for both.
        let produced = supplier();
        Some(
            self.defaults
                .lock()
                .entry(name.to_string())
                .or_insert(produced)
                .clone(),
        )
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.value(name)?.downcast::<T>()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.supplied.contains(name)
    }

    /// Identity of every supplied value, in declaration order.
    ///
    /// Absent arguments occupy their slot as `None`, so binding one value
    /// under two different names never collapses.
    pub fn identity_key(&self) -> CacheKey {
        let identities: Vec<Option<usize>> = self
            .schema
            .descriptors
            .iter()
            .map(|d| self.supplied.get(&d.name).map(ArgValue::identity))
            .collect();
        CacheKey::new(identities)
    }
}

impl fmt::Debug for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arguments")
            .field("schema", &self.schema)
            .field("supplied", &self.supplied)
            .finish()
    }
}
