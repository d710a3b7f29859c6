//! Empty aggregate shells for replay.
//!
//! A loaded aggregate must not re-run the business rules that guarded its
//! creation. The factory builds a bare [`AggregateRoot`] from an identifier,
//! an optional starting version and an optional tenant, and nothing else;
//! the repository then replays history onto it.

use std::{fmt, sync::Arc};

use crate::{
    aggregate::{Aggregate, AggregateRoot, ConstructionError},
    clock::Clock,
    id::Identifier,
};

/// The argument set a shell is requested with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShellShape {
    Id,
    IdVersion,
    IdTenant,
    IdVersionTenant,
}

impl ShellShape {
    /// Whether aggregates with the given tenant scoping can be built from
    /// this shape.
    pub const fn fits(self, tenant_scoped: bool) -> bool {
        match self {
            Self::Id | Self::IdVersion => !tenant_scoped,
            Self::IdTenant | Self::IdVersionTenant => tenant_scoped,
        }
    }
}

impl fmt::Display for ShellShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Id => "(id)",
            Self::IdVersion => "(id, version)",
            Self::IdTenant => "(id, tenant)",
            Self::IdVersionTenant => "(id, version, tenant)",
        })
    }
}

/// Arguments for [`AggregateFactory::shell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellArgs<Id> {
    id: Id,
    version: Option<u64>,
    tenant_id: Option<String>,
}

impl<Id> ShellArgs<Id> {
    pub const fn new(id: Id) -> Self {
        Self {
            id,
            version: None,
            tenant_id: None,
        }
    }

    #[must_use]
    pub const fn at_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    #[must_use]
    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub const fn shape(&self) -> ShellShape {
        match (self.version.is_some(), self.tenant_id.is_some()) {
            (false, false) => ShellShape::Id,
            (true, false) => ShellShape::IdVersion,
            (false, true) => ShellShape::IdTenant,
            (true, true) => ShellShape::IdVersionTenant,
        }
    }
}

/// Builds replay targets.
#[derive(Clone, Debug)]
pub struct AggregateFactory {
    clock: Arc<dyn Clock>,
}

impl AggregateFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Clock handed to every shell this factory builds.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Build an uninitialized root with no events and no domain validation.
    ///
    /// Tenant-scoped aggregates are built from shapes carrying a tenant;
    /// all others from shapes without one.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::EmptyId`] for the empty identifier and
    /// [`ConstructionError::MissingConstructor`] if the argument shape does
    /// not fit the aggregate type.
    pub fn shell<A: Aggregate>(
        &self,
        args: ShellArgs<A::Id>,
    ) -> Result<AggregateRoot<A>, ConstructionError> {
        let shape = args.shape();
        if !shape.fits(A::TENANT_SCOPED) {
            tracing::error!(aggregate_kind = A::KIND, %shape, "no construction path for shape");
            return Err(ConstructionError::MissingConstructor {
                kind: A::KIND,
                shape,
            });
        }
        if args.id.is_empty() {
            return Err(ConstructionError::EmptyId { kind: A::KIND });
        }
        Ok(AggregateRoot::shell(
            args.id,
            args.version.unwrap_or(0),
            args.tenant_id,
            Arc::clone(&self.clock),
        ))
    }
}
