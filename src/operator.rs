use crate::identity::ResourceIdentity;
use crate::reconciler::{Outcome, ResourceController};
use crate::state::{ChangeSet, DesiredState};
use crate::store::{Record, StateStore};
use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use futures::future::join_all;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior};

/// Rounds spent on one resource per pass before giving up until the next.
const MAX_ROUNDS: usize = 3;

/// One declared resource.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
pub struct Declaration {
    #[serde(rename = "type")]
    pub kind: String,
    /// Adopt an existing resource instead of creating one.
    #[serde(default)]
    pub import: Option<String>,
    #[serde(flatten)]
    pub desired: DesiredState,
}

pub struct Operator<S>
where
    S: StateStore,
{
    controllers: HashMap<&'static str, Arc<dyn ResourceController>>,
    store: S,
    declarations: IndexMap<String, Declaration>,
}

impl<S> Operator<S>
where
    S: StateStore,
{
    pub fn new(store: S, declarations: IndexMap<String, Declaration>) -> Self {
        Self {
            controllers: HashMap::new(),
            store,
            declarations,
        }
    }

    pub fn register<C>(mut self, controller: C) -> Self
    where
        C: ResourceController + 'static,
    {
        self.controllers.insert(controller.kind(), Arc::new(controller));
        self
    }

    /// Fail on declarations no registered controller handles.
    pub fn check(&self) -> anyhow::Result<()> {
        for (name, declaration) in &self.declarations {
            self.controller(&declaration.kind)
                .with_context(|| format!("Invalid declaration '{name}'"))?;
        }
        Ok(())
    }

    fn controller(&self, kind: &str) -> anyhow::Result<&dyn ResourceController> {
        self.controllers
            .get(kind)
            .map(|c| c.as_ref())
            .ok_or_else(|| anyhow!("unknown resource type '{kind}'"))
    }

    /// One pass over every declared and every orphaned resource.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let results = join_all(
            self.declarations
                .iter()
                .map(|(name, declaration)| self.reconcile_declared(name, declaration)),
        )
        .await;

        let mut failed = 0;
        for (name, result) in self.declarations.keys().zip(results) {
            match result {
                Ok(Outcome::Complete) => log::debug!("{name}: up to date"),
                Ok(Outcome::Retry) => log::info!("{name}: still converging"),
                Err(err) => {
                    log::warn!("{name}: failed to reconcile: {err:#}");
                    failed += 1;
                }
            }
        }

        self.delete_orphans().await?;

        if failed > 0 {
            bail!("{failed} resource(s) failed to reconcile");
        }
        Ok(())
    }

    pub async fn run(&self, interval: Duration) {
        log::info!("Reconciling resources with interval {:?}", interval);
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            if let Err(err) = self.reconcile().await {
                log::warn!("Reconcile pass failed: {err:#}");
            }
        }
    }

    async fn reconcile_declared(&self, name: &str, declaration: &Declaration) -> anyhow::Result<Outcome> {
        let controller = self.controller(&declaration.kind)?;
        for round in 1..=MAX_ROUNDS {
            match self.reconcile_round(name, declaration, controller).await? {
                Outcome::Complete => return Ok(Outcome::Complete),
                Outcome::Retry => log::debug!("{name}: round {round} needs another round"),
            }
        }
        Ok(Outcome::Retry)
    }

    async fn reconcile_round(
        &self,
        name: &str,
        declaration: &Declaration,
        controller: &dyn ResourceController,
    ) -> anyhow::Result<Outcome> {
        let mut record = match self.store.get(name).await? {
            Some(record) if record.kind == declaration.kind => record,
            Some(record) => bail!(
                "type changed from '{}' to '{}', remove the declaration first",
                record.kind,
                declaration.kind
            ),
            None => Record::new(controller.kind()),
        };

        let identity = match record.identity()? {
            Some(identity) => identity,
            None => {
                match &declaration.import {
                    Some(external_id) => {
                        let imported = controller.import(external_id).await?;
                        log::info!("{name}: imported {}", imported.identity);
                        record.identity = Some(imported.identity.to_string());
                        record.observed = imported.observed;
                        self.store.put(name, record).await?;
                    }
                    None => {
                        let identity = controller.create(&declaration.desired).await?;
                        log::info!("{name}: created {identity}");
                        // from here on a failure must not lose the remote resource
                        record.identity = Some(identity.to_string());
                        self.store.put(name, record.clone()).await?;
                        self.activate(name, &identity, declaration, controller, record)
                            .await?;
                    }
                }
                return Ok(Outcome::Retry);
            }
        };

        let observed = match controller.read(&identity).await? {
            Some(observed) => observed,
            None => {
                log::warn!("{name}: {identity} no longer exists, recreating");
                record.clear();
                self.store.put(name, record).await?;
                return Ok(Outcome::Retry);
            }
        };

        if !controller.is_active(&observed) {
            log::info!("{name}: {identity} is not in service yet");
            self.activate(name, &identity, declaration, controller, record)
                .await?;
            return Ok(Outcome::Retry);
        }

        let changes = controller.changes(&declaration.desired, &observed)?;
        if changes.is_empty() {
            record.observed = observed;
            record.pending = ChangeSet::default();
            record.last_reconciled = Some(Utc::now());
            self.store.put(name, record).await?;
            return Ok(Outcome::Complete);
        }

        if controller.requires_replacement(&changes) {
            log::info!("{name}: {changes} require replacing {identity}");
            controller.delete(&identity).await?;
            record.clear();
            self.store.put(name, record).await?;
            return Ok(Outcome::Retry);
        }

        record.pending = changes;
        record.observed = observed.clone();
        self.store.put(name, record.clone()).await?;

        let refreshed = controller
            .update(&identity, &declaration.desired, &observed)
            .await?;
        match refreshed {
            Some(observed) => {
                record.observed = observed;
                record.pending = ChangeSet::default();
            }
            None => record.clear(),
        }
        record.last_reconciled = Some(Utc::now());
        self.store.put(name, record).await?;

        Ok(Outcome::Retry)
    }

    async fn activate(
        &self,
        name: &str,
        identity: &ResourceIdentity,
        declaration: &Declaration,
        controller: &dyn ResourceController,
        mut record: Record,
    ) -> anyhow::Result<()> {
        let observed = controller
            .activate(identity, &declaration.desired)
            .await
            .with_context(|| format!("Failed to activate {identity}, retrying on the next pass"))?;
        log::info!("{name}: {identity} is in service");
        record.observed = observed;
        self.store.put(name, record).await
    }

    /// Delete what is stored but no longer declared.
    async fn delete_orphans(&self) -> anyhow::Result<()> {
        for name in self.store.names().await? {
            if self.declarations.contains_key(&name) {
                continue;
            }
            let record = match self.store.get(&name).await? {
                Some(record) => record,
                None => continue,
            };
            if let Some(identity) = record.identity()? {
                log::info!("{name}: no longer declared, deleting {identity}");
                self.controller(&record.kind)?
                    .delete(&identity)
                    .await
                    .with_context(|| format!("Failed to delete '{name}'"))?;
            }
            self.store.remove(&name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::listener::ListenerController;
    use crate::state::FieldValue;
    use crate::store::MemoryStore;
    use crate::testing::{policy, FakeVendor};
    use crate::vpc::VpcController;

    fn declarations(yaml: &str) -> IndexMap<String, Declaration> {
        serde_yaml::from_str(yaml).unwrap()
    }

    const WEB: &str = r#"
web:
  type: listener
  load_balancer_id: lb-1
  protocol: tcp
  frontend_port: 80
  backend_port: 8080
  bandwidth: 10
"#;

    fn operator(
        vendor: &Arc<FakeVendor>,
        store: &Arc<MemoryStore>,
        yaml: &str,
    ) -> Operator<Arc<MemoryStore>> {
        Operator::new(store.clone(), declarations(yaml))
            .register(ListenerController::new(vendor.clone(), policy()))
            .register(VpcController::new(vendor.clone(), policy()))
    }

    fn mutations(vendor: &FakeVendor) -> Vec<String> {
        vendor
            .actions()
            .into_iter()
            .filter(|a| !a.starts_with("Describe"))
            .collect()
    }

    #[test]
    fn declarations_flatten_desired_state() {
        let declarations = declarations(WEB);
        let web = &declarations["web"];
        assert_eq!(web.kind, "listener");
        assert_eq!(web.import, None);
        assert_eq!(web.desired.get_i64("frontend_port"), Some(80));
        assert!(!web.desired.contains("type"));
    }

    #[tokio::test(start_paused = true)]
    async fn creates_then_idles() {
        let vendor = Arc::new(FakeVendor::default().with_load_balancer("lb-1", "slb.s1.small"));
        let store = Arc::new(MemoryStore::default());
        let operator = operator(&vendor, &store, WEB);

        operator.reconcile().await.unwrap();
        assert_eq!(vendor.listener_ports("lb-1"), vec![80]);
        let record = store.get("web").await.unwrap().unwrap();
        assert_eq!(record.identity.as_deref(), Some("lb-1:80"));
        assert_eq!(record.observed.get_str("status"), Some("running"));
        assert!(record.last_reconciled.is_some());

        vendor.clear_calls();
        operator.reconcile().await.unwrap();
        assert!(mutations(&vendor).is_empty(), "{:?}", vendor.actions());
    }

    #[tokio::test(start_paused = true)]
    async fn repairs_field_drift() {
        let vendor = Arc::new(FakeVendor::default().with_load_balancer("lb-1", "slb.s1.small"));
        let store = Arc::new(MemoryStore::default());
        let operator = operator(&vendor, &store, WEB);
        operator.reconcile().await.unwrap();

        vendor.set_listener_attribute("lb-1", 80, "Scheduler", "rr");
        vendor.clear_calls();
        operator.reconcile().await.unwrap();

        assert_eq!(mutations(&vendor), vec!["SetLoadBalancerTCPListenerAttribute"]);
        let record = store.get("web").await.unwrap().unwrap();
        assert_eq!(record.observed.get_str("scheduler"), Some("wrr"));
        assert!(record.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recreates_deleted_resource() {
        let vendor = Arc::new(FakeVendor::default().with_load_balancer("lb-1", "slb.s1.small"));
        let store = Arc::new(MemoryStore::default());
        let operator = operator(&vendor, &store, WEB);
        operator.reconcile().await.unwrap();

        vendor.remove_listener("lb-1", 80);
        operator.reconcile().await.unwrap();

        assert_eq!(vendor.listener_ports("lb-1"), vec![80]);
        assert_eq!(vendor.count("CreateLoadBalancerTCPListener"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replaces_on_force_new_change() {
        let vendor = Arc::new(FakeVendor::default().with_load_balancer("lb-1", "slb.s1.small"));
        let store = Arc::new(MemoryStore::default());
        operator(&vendor, &store, WEB).reconcile().await.unwrap();
        vendor.clear_calls();

        let changed = WEB.replace("backend_port: 8080", "backend_port: 9090");
        operator(&vendor, &store, &changed).reconcile().await.unwrap();

        assert_eq!(
            mutations(&vendor),
            vec![
                "DeleteLoadBalancerListener",
                "CreateLoadBalancerTCPListener",
                "StartLoadBalancerListener",
            ]
        );
        let record = store.get("web").await.unwrap().unwrap();
        assert_eq!(record.observed.get_i64("backend_port"), Some(9090));
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_listener_that_failed_to_start() {
        let vendor = Arc::new(FakeVendor::default().with_load_balancer("lb-1", "slb.s1.small"));
        vendor.fail("StartLoadBalancerListener", "Forbidden.RAM", 1);
        let store = Arc::new(MemoryStore::default());
        let operator = operator(&vendor, &store, WEB);

        assert!(operator.reconcile().await.is_err());
        let record = store.get("web").await.unwrap().unwrap();
        assert_eq!(record.identity.as_deref(), Some("lb-1:80"));

        operator.reconcile().await.unwrap();
        operator.reconcile().await.unwrap();

        assert_eq!(vendor.count("CreateLoadBalancerTCPListener"), 1);
        assert_eq!(vendor.count("StartLoadBalancerListener"), 2);
        let record = store.get("web").await.unwrap().unwrap();
        assert_eq!(record.observed.get_str("status"), Some("running"));
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_network_whose_settings_failed() {
        let vendor = Arc::new(FakeVendor::default());
        vendor.fail("TagResources", "Forbidden.RAM", 2);
        let store = Arc::new(MemoryStore::default());
        let yaml = "
network:
  type: vpc
  cidr_block: 172.16.0.0/12
  vpc_name: main
  tags:
    env: prod
";
        let operator = operator(&vendor, &store, yaml);

        assert!(operator.reconcile().await.is_err());
        assert!(operator.reconcile().await.is_err());
        operator.reconcile().await.unwrap();

        assert_eq!(vendor.count("CreateVpc"), 1);
        assert_eq!(vendor.count("DeleteVpc"), 0);
        assert_eq!(vendor.count("TagResources"), 3);
        let record = store.get("network").await.unwrap().unwrap();
        assert_eq!(record.identity.as_deref(), Some("eu-central-1:vpc-0001"));
        let tags = record.observed.get("tags").and_then(FieldValue::as_map).unwrap();
        assert_eq!(tags.get("env"), Some(&FieldValue::from("prod")));

        vendor.clear_calls();
        operator.reconcile().await.unwrap();
        assert!(mutations(&vendor).is_empty(), "{:?}", vendor.actions());
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_undeclared_resources() {
        let vendor = Arc::new(FakeVendor::default().with_load_balancer("lb-1", "slb.s1.small"));
        let store = Arc::new(MemoryStore::default());
        operator(&vendor, &store, WEB).reconcile().await.unwrap();

        operator(&vendor, &store, "{}").reconcile().await.unwrap();

        assert!(vendor.listener_ports("lb-1").is_empty());
        assert!(store.names().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn imports_and_updates() {
        let vendor = Arc::new(FakeVendor::default().with_load_balancer("lb-1", "slb.s1.small"));
        let store = Arc::new(MemoryStore::default());
        let existing = DesiredState::new()
            .with("load_balancer_id", "lb-1")
            .with("protocol", "tcp")
            .with("frontend_port", 80)
            .with("backend_port", 8080)
            .with("bandwidth", 10)
            .with("scheduler", "rr");
        let listeners = ListenerController::new(vendor.clone(), policy());
        let identity = listeners.create(&existing).await.unwrap();
        listeners.activate(&identity, &existing).await.unwrap();
        vendor.clear_calls();

        let yaml = format!("{WEB}  import: lb-1:80\n");
        operator(&vendor, &store, &yaml).reconcile().await.unwrap();

        assert_eq!(mutations(&vendor), vec!["SetLoadBalancerTCPListenerAttribute"]);
        let record = store.get("web").await.unwrap().unwrap();
        assert_eq!(record.identity.as_deref(), Some("lb-1:80"));
        assert_eq!(record.observed.get_str("scheduler"), Some("wrr"));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_isolated() {
        let vendor = Arc::new(FakeVendor::default().with_load_balancer("lb-1", "slb.s1.small"));
        let store = Arc::new(MemoryStore::default());
        let yaml = format!(
            "{WEB}
secure:
  type: listener
  load_balancer_id: lb-1
  protocol: https
  frontend_port: 443
network:
  type: vpc
  cidr_block: 172.16.0.0/12
  vpc_name: main
"
        );
        let operator = operator(&vendor, &store, &yaml);

        let err = operator.reconcile().await.unwrap_err();
        assert!(err.to_string().contains("1 resource"), "{err}");
        assert_eq!(vendor.listener_ports("lb-1"), vec![80]);
        assert!(store.get("secure").await.unwrap().is_none());
        let network = store.get("network").await.unwrap().unwrap();
        assert_eq!(network.kind, "vpc");
        assert!(network.identity.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_type_is_rejected() {
        let vendor = Arc::new(FakeVendor::default());
        let store = Arc::new(MemoryStore::default());
        let operator = operator(&vendor, &store, "db:\n  type: database\n");
        assert!(operator.check().is_err());
        assert!(operator.reconcile().await.is_err());
        assert!(vendor.actions().is_empty());
    }
}
