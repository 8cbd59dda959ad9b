use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use jsonschema::JSONSchema;
use serde_json::Value;

use super::ToolDescriptor;
use crate::error::{Error, ErrorKind};
use crate::transport::{Connection, ConnectionState};

struct Entry {
    descriptor: ToolDescriptor,
    validator: JSONSchema,
    connection: Weak<Connection>,
}

impl Entry {
    fn live_connection(&self) -> Option<Arc<Connection>> {
        self.connection
            .upgrade()
            .filter(|connection| connection.state() == ConnectionState::Ready)
    }
}

/// Collects tool descriptors from tool servers.
///
/// A server is registered as a whole: if any of its tools clashes with an
/// already registered name or carries an unusable schema, none of its
/// tools are added.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl RegistryBuilder {
    /// Creates an empty builder.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists the tools of a ready connection and registers them.
    pub async fn register(
        &mut self,
        connection: &Arc<Connection>,
    ) -> Result<Vec<ToolDescriptor>, Error> {
        let descriptors = connection.list_tools().await.map_err(|err| {
            if err.kind() == ErrorKind::Registration {
                err
            } else {
                Error::registration().with_reason(format!(
                    "cannot list tools of `{}`: {err}",
                    connection.name()
                ))
            }
        })?;
        self.add(connection, descriptors.clone())?;
        Ok(descriptors)
    }

    /// Registers descriptors served by `connection`.
    pub fn add(
        &mut self,
        connection: &Arc<Connection>,
        descriptors: Vec<ToolDescriptor>,
    ) -> Result<(), Error> {
        let mut seen = HashSet::new();
        let mut validators = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            let name = descriptor.name.as_str();
            if name.is_empty() {
                return Err(Error::registration()
                    .with_reason(format!("`{}` advertised a tool without name", connection.name())));
            }
            if self.index.contains_key(name) || !seen.insert(name) {
                return Err(Error::registration()
                    .with_reason(format!("duplicate tool name `{name}`")));
            }
            let validator = JSONSchema::options()
                .compile(&descriptor.parameter_schema)
                .map_err(|err| {
                    Error::registration()
                        .with_reason(format!("invalid schema for `{name}`: {err}"))
                })?;
            validators.push(validator);
        }

        for (descriptor, validator) in descriptors.into_iter().zip(validators) {
            debug!("registered `{}` from `{}`", descriptor.name, connection.name());
            self.index.insert(descriptor.name.clone(), self.entries.len());
            self.entries.push(Entry {
                descriptor,
                validator,
                connection: Arc::downgrade(connection),
            });
        }
        Ok(())
    }

    /// Finishes registration.
    #[inline]
    pub fn build(self) -> Registry {
        Registry {
            entries: self.entries,
            index: self.index,
        }
    }
}

/// The read-only set of registered tools.
///
/// A tool whose server has died stays in the registry but is no longer
/// reported by [`Registry::descriptors`] and can't be looked up.
#[derive(Default)]
pub struct Registry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl Registry {
    fn entry(&self, name: &str) -> Result<&Entry, Error> {
        self.index
            .get(name)
            .map(|&index| &self.entries[index])
            .ok_or_else(|| {
                Error::unknown_tool().with_reason(format!("no tool named `{name}`"))
            })
    }

    /// Returns the descriptor of a usable tool.
    pub fn lookup(&self, name: &str) -> Result<&ToolDescriptor, Error> {
        let entry = self.entry(name)?;
        match entry.live_connection() {
            Some(_) => Ok(&entry.descriptor),
            None => Err(Error::unknown_tool()
                .with_reason(format!("the server providing `{name}` is unavailable"))),
        }
    }

    /// Returns the connection serving a usable tool.
    pub fn connection(&self, name: &str) -> Result<Arc<Connection>, Error> {
        self.entry(name)?.live_connection().ok_or_else(|| {
            Error::unknown_tool()
                .with_reason(format!("the server providing `{name}` is unavailable"))
        })
    }

    /// Returns descriptors of all usable tools, in registration order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.entries
            .iter()
            .filter(|entry| entry.live_connection().is_some())
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// Checks arguments against the tool's parameter schema.
    ///
    /// A violation is a parse error: the model produced a call that
    /// can't be sent as is. A tool whose server is gone is unknown, whatever
    /// the arguments.
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<(), Error> {
        let entry = self.entry(name)?;
        if entry.live_connection().is_none() {
            return Err(Error::unknown_tool()
                .with_reason(format!("the server providing `{name}` is unavailable")));
        }
        if let Err(errors) = entry.validator.validate(arguments) {
            let message = errors
                .map(|err| err.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::parse()
                .with_reason(format!("invalid arguments for `{name}`: {message}")));
        }
        Ok(())
    }

    /// Returns the number of registered tools, usable or not.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no tool is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
