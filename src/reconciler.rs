use crate::client::{ClientError, Params, VendorClient};
use crate::error::{ReconcileError, Result};
use crate::identity::ResourceIdentity;
use crate::retry::{self, Failure, RetryPolicy};
use crate::state::{ChangeSet, DesiredState, ObservedState};
use async_trait::async_trait;
use serde_json::Value;

/// Result of reconciling one declared resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Retry,
}

/// A resource brought under management by import.
#[derive(Clone, Debug, PartialEq)]
pub struct Imported {
    pub identity: ResourceIdentity,
    pub desired: DesiredState,
    pub observed: ObservedState,
}

/// Lifecycle of one resource type against the vendor API.
#[async_trait]
pub trait ResourceController: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Issue the create request. The identity is returned as soon as the
    /// vendor accepts it, before the resource is in service.
    async fn create(&self, desired: &DesiredState) -> Result<ResourceIdentity>;

    /// Bring a created resource into service and wait until it is. Repeating
    /// it on an active resource only re-reads it.
    async fn activate(
        &self,
        identity: &ResourceIdentity,
        desired: &DesiredState,
    ) -> Result<ObservedState>;

    /// Whether the observation shows the resource in service.
    fn is_active(&self, observed: &ObservedState) -> bool;

    /// `None` when the vendor no longer knows the resource.
    async fn read(&self, identity: &ResourceIdentity) -> Result<Option<ObservedState>>;

    /// Apply what changed between `desired` and `observed`, returning the
    /// refreshed observation.
    async fn update(
        &self,
        identity: &ResourceIdentity,
        desired: &DesiredState,
        observed: &ObservedState,
    ) -> Result<Option<ObservedState>>;

    async fn delete(&self, identity: &ResourceIdentity) -> Result<()>;

    /// Fields of `desired` that differ from `observed` and matter for the
    /// resource's variant.
    fn changes(&self, desired: &DesiredState, observed: &ObservedState) -> Result<ChangeSet>;

    fn requires_replacement(&self, changes: &ChangeSet) -> bool;

    /// Reconstruct the desired state from an observation.
    fn backfill(&self, observed: &ObservedState) -> DesiredState;

    async fn import(&self, external_id: &str) -> Result<Imported> {
        let identity: ResourceIdentity = external_id.parse()?;
        match self.read(&identity).await? {
            Some(observed) => Ok(Imported {
                desired: self.backfill(&observed),
                identity,
                observed,
            }),
            None => Err(ReconcileError::NotFound {
                action: format!("import {}", self.kind()),
                identity: identity.to_string(),
            }),
        }
    }
}

/// Vendor error codes of one API family.
#[derive(Debug)]
pub struct ErrorCodes {
    pub transient: &'static [&'static str],
    pub not_found: &'static [&'static str],
}

impl ErrorCodes {
    pub fn is_transient(&self, err: &ClientError) -> bool {
        err.is_any_of(self.transient)
    }

    pub fn is_not_found(&self, err: &ClientError) -> bool {
        err.is_any_of(self.not_found)
    }
}

/// Vendor access shared by the controllers: every call goes through the
/// retry executor and failures carry action and identity.
pub struct Api<C> {
    client: C,
    policy: RetryPolicy,
    codes: &'static ErrorCodes,
}

impl<C: VendorClient> Api<C> {
    pub fn new(client: C, policy: RetryPolicy, codes: &'static ErrorCodes) -> Self {
        Self {
            client,
            policy,
            codes,
        }
    }

    pub fn region(&self) -> &str {
        self.client.region()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn call(&self, action: &str, identity: &str, params: &Params) -> Result<Value> {
        log::debug!("{action} on '{identity}': {params:?}");
        retry::execute_with_retry(
            &self.policy,
            |err| self.codes.is_transient(err),
            || self.client.call(action, params),
        )
        .await
        .map_err(|failure| self.failure(action, identity, failure))
    }

    /// Like [`Api::call`], with vendor "not found" answered as `None`.
    pub async fn describe(
        &self,
        action: &str,
        identity: &str,
        params: &Params,
    ) -> Result<Option<Value>> {
        match self.call(action, identity, params).await {
            Ok(value) => Ok(Some(value)),
            Err(ReconcileError::Remote { source, .. }) if self.codes.is_not_found(&source) => {
                log::debug!("{action}: '{identity}' not found ({source})");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`Api::call`], with vendor "not found" counting as done.
    pub async fn remove(&self, action: &str, identity: &str, params: &Params) -> Result<bool> {
        self.describe(action, identity, params)
            .await
            .map(|r| r.is_some())
    }

    fn failure(&self, action: &str, identity: &str, failure: Failure<ClientError>) -> ReconcileError {
        match failure {
            Failure::Permanent(source) => ReconcileError::remote(action, identity, source),
            Failure::Timeout { elapsed, last } => ReconcileError::Timeout {
                action: action.to_string(),
                identity: identity.to_string(),
                elapsed,
                last_error: last.map(|e| e.to_string()),
            },
        }
    }
}

/// Poll `read` until `predicate` accepts the observation.
pub async fn wait_for<R, F, P>(
    policy: &RetryPolicy,
    waiting_for: &str,
    identity: &ResourceIdentity,
    read: F,
    predicate: P,
) -> Result<Option<ObservedState>>
where
    F: FnMut() -> R,
    R: std::future::Future<Output = Result<Option<ObservedState>>>,
    P: Fn(Option<&ObservedState>) -> bool,
{
    log::debug!("Waiting for {waiting_for} on '{identity}'");
    retry::wait_for_state(
        policy,
        |err: &ReconcileError| matches!(err, ReconcileError::Timeout { .. }),
        read,
        predicate,
    )
    .await
    .map_err(|failure| match failure {
        Failure::Permanent(err) => err,
        Failure::Timeout { elapsed, last } => ReconcileError::Timeout {
            action: waiting_for.to_string(),
            identity: identity.to_string(),
            elapsed,
            last_error: last.map(|e| e.to_string()),
        },
    })
}

/// Observation reports `status == expected`.
pub fn has_status(expected: &'static str) -> impl Fn(Option<&ObservedState>) -> bool {
    move |observed| {
        observed
            .and_then(|o| o.get_str("status"))
            .map(|s| s.eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    }
}

/// Observation reports one of `expected`.
pub fn has_any_status(
    expected: &'static [&'static str],
) -> impl Fn(Option<&ObservedState>) -> bool {
    move |observed| {
        observed
            .and_then(|o| o.get_str("status"))
            .map(|s| expected.iter().any(|e| s.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }
}

pub fn is_absent(observed: Option<&ObservedState>) -> bool {
    observed.is_none()
}
