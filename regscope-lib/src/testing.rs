//! A session wired to the slave simulator through an in-memory pipe.

use std::{sync::Arc, time::Duration};

use tokio::{io::duplex, sync::Mutex, task::JoinHandle};

use crate::protocol::slave::{self, RegisterBank, SlaveStats};
use crate::protocol::Result;
use crate::regs::{RegisterDefinition, RegisterMap};
use crate::session::{ConnectionSettings, Session};
use crate::transport::StreamTransport;

pub struct Simulated {
    pub session: Session,
    pub bank: Arc<Mutex<RegisterBank>>,
    server: JoinHandle<Result<SlaveStats>>,
}

impl Simulated {
    pub fn new(setup: impl FnOnce(&mut RegisterBank), registers: Vec<RegisterDefinition>) -> Self {
        Self::with_timeout(setup, registers, Duration::from_millis(200))
    }

    pub fn with_timeout(
        setup: impl FnOnce(&mut RegisterBank),
        registers: Vec<RegisterDefinition>,
        limit: Duration,
    ) -> Self {
        let mut bank = RegisterBank::new(1);
        setup(&mut bank);
        let bank = Arc::new(Mutex::new(bank));

        let (near, far) = duplex(1024);
        let server = tokio::spawn(slave::serve(far, bank.clone()));

        let settings = ConnectionSettings {
            port: "simulator".into(),
            timeout: limit.as_secs_f64(),
            ..Default::default()
        };
        let session = Session::with_transport(
            settings,
            RegisterMap::from_definitions(registers).unwrap(),
            Box::new(StreamTransport::new(near)),
        );

        Simulated {
            session,
            bank,
            server,
        }
    }

    /// Drops the line and returns what the device saw. Every other clone of
    /// the session must be gone already.
    pub async fn finish(self) -> SlaveStats {
        drop(self.session);
        self.server.await.unwrap().unwrap()
    }
}
