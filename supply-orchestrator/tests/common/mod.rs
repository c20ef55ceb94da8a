#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use supply_common::bus::ApproveTicket;
use supply_common::{StepName, StepStatus, SuborderRequest};
use supply_orchestrator::algorithm::Registry;
use supply_orchestrator::generator::GeneratorConfig;
use supply_orchestrator::store::{DeviceFilter, OrderFilter};
use supply_orchestrator::workflow::EngineConfig;
use supply_orchestrator::{Clients, Engine, Generator, MemoryStore, Settings, Store};
use supply_providers::mock::MockCloud;

pub const STAGING: i64 = 5_000_001;
pub const TARGET_BIZ: i64 = 900;

pub struct Harness {
    pub cloud: Arc<MockCloud>,
    pub store: Arc<MemoryStore>,
    pub engine: Engine,
}

pub fn harness(cloud: Arc<MockCloud>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let settings = Settings {
        staging_biz_id: STAGING,
        ..Settings::default()
    };
    let clients = Clients::from_backend(cloud.clone());
    let generator = Arc::new(Generator::new(
        store.clone(),
        clients.clone(),
        Arc::new(Registry::default_dvm().unwrap()),
        GeneratorConfig::from(&settings),
    ));
    let engine = Engine::new(
        store.clone(),
        clients,
        generator,
        EngineConfig::from(&settings),
    );
    Harness {
        cloud,
        store,
        engine,
    }
}

impl Harness {
    /// Create, submit and approve a ticket; returns the suborder ids.
    pub async fn approve(&self, subs: Vec<SuborderRequest>) -> Vec<String> {
        let ticket = self
            .engine
            .create_ticket(TARGET_BIZ, "erin", subs)
            .await
            .unwrap();
        self.engine
            .submit_ticket(ticket.order_id, None)
            .await
            .unwrap();
        self.engine
            .approve_ticket(&ApproveTicket {
                order_id: ticket.order_id,
                approved: true,
                operator: "lead".into(),
                message: String::new(),
            })
            .await
            .unwrap()
    }

    /// No two devices of a suborder share an IP, and no step ran ahead of its predecessor.
    pub async fn assert_invariants(&self) {
        let orders = self.store.find_orders(&OrderFilter::default()).await.unwrap();
        for o in orders {
            let devices = self
                .store
                .find_devices(&DeviceFilter::suborder(&o.suborder_id))
                .await
                .unwrap();
            let ips: HashSet<&str> = devices.iter().map(|d| d.ip.as_str()).collect();
            assert_eq!(ips.len(), devices.len(), "duplicate device in {}", o.suborder_id);

            let steps = self.store.find_steps(&o.suborder_id).await.unwrap();
            let status = |name: StepName| {
                steps
                    .iter()
                    .find(|s| s.step == name)
                    .map(|s| s.status)
                    .unwrap_or(StepStatus::Init)
            };
            if status(StepName::Init) == StepStatus::Success {
                assert_eq!(status(StepName::Generate), StepStatus::Success);
            }
            if status(StepName::Deliver) == StepStatus::Success {
                assert_eq!(status(StepName::Init), StepStatus::Success);
            }
        }
    }
}
