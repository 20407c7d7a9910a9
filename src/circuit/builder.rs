//! Circuit construction
//!
//! Builds a circuit hop by hop: CREATE (or CREATE_FAST) with the first
//! router, then one EXTEND per further router, always sent as
//! RELAY_EARLY. Each handshake waits at most the configured build timeout.
//! A circuit that fails half-way is destroyed and, when nothing else uses
//! it, so is its connection.

use super::{destroy_reason, Circuit, CircuitEvent};
use crate::config::{Settings, MAX_ROUTE_LENGTH};
use crate::connection_pool::{Connection, ConnectionPool};
use crate::error::{Result, TorError};
use crate::protocol::{
    create_onion_skin, CellCommand, ClientHandshake, DhKeyPair, FastHandshake, Hop, RelayMsg,
    Router, DH_REPLY_LEN, FAST_REPLY_LEN,
};
use std::sync::Arc;

/// Builds circuits over pooled connections
pub struct CircuitBuilder {
    settings: Arc<Settings>,
    connections: Arc<ConnectionPool>,
}

/// Destroys a circuit under construction unless disarmed
struct BuildGuard<'a> {
    circuit: &'a Arc<Circuit>,
    connection: &'a Arc<Connection>,
    armed: bool,
}

impl BuildGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.circuit.destroy(destroy_reason::FINISHED);
        if self.connection.circuit_count() == 0 {
            log::debug!(
                "Closing idle link to {} after failed build",
                self.connection.router().nickname
            );
            self.connection.close();
        }
    }
}

impl CircuitBuilder {
    pub fn new(settings: Arc<Settings>, connections: Arc<ConnectionPool>) -> Self {
        Self {
            settings,
            connections,
        }
    }

    /// Build a circuit through `path`, guard first
    pub async fn build(&self, path: &[Router]) -> Result<Arc<Circuit>> {
        if path.is_empty() || path.len() > MAX_ROUTE_LENGTH {
            return Err(TorError::InvalidConfig(format!(
                "Route of {} hops (allowed 1..={})",
                path.len(),
                MAX_ROUTE_LENGTH
            )));
        }
        log::info!(
            "🔨 Building {}-hop circuit: {}",
            path.len(),
            path.iter()
                .map(|r| r.nickname.as_str())
                .collect::<Vec<_>>()
                .join(" → ")
        );

        let connection = self.connections.get_or_connect(&path[0]).await?;
        let (id, inbound) = connection.allocate_circuit()?;
        let circuit = Circuit::start(
            id,
            connection.clone(),
            inbound,
            self.settings.clone(),
            path.len(),
        );
        let guard = BuildGuard {
            circuit: &circuit,
            connection: &connection,
            armed: true,
        };

        self.create_first_hop(&circuit, &path[0]).await?;
        for (index, router) in path.iter().enumerate().skip(1) {
            self.extend(&circuit, index, router).await?;
        }
        circuit.set_established()?;
        guard.disarm();

        log::info!(
            "✅ Circuit {} established ({} hops, id {})",
            circuit.serial(),
            path.len(),
            circuit.id()
        );
        Ok(circuit)
    }

    async fn create_first_hop(&self, circuit: &Arc<Circuit>, router: &Router) -> Result<()> {
        circuit.set_building(0)?;
        let (handshake, label, expected) = {
            let mut rng = rand::thread_rng();
            if self.settings.use_create_fast {
                let fast = FastHandshake::new(&mut rng);
                circuit.send_cell(CellCommand::CreateFast, fast.key_material())?;
                (ClientHandshake::Fast(fast), "CREATE_FAST", CellCommand::CreatedFast)
            } else {
                let dh = DhKeyPair::generate(&mut rng);
                let skin = create_onion_skin(&mut rng, &router.onion_key, &dh)?;
                circuit.send_cell(CellCommand::Create, &skin)?;
                (ClientHandshake::Dh(dh), "CREATE", CellCommand::Created)
            }
        };
        log::debug!("📤 {} sent to {}", label, router.nickname);

        let reply = circuit
            .wait_event(
                self.settings.circuit_build_timeout(),
                |event| match event {
                    CircuitEvent::Created { command, payload } if command == expected => {
                        Some(Ok(payload))
                    }
                    CircuitEvent::Created { command, .. } => Some(Err(TorError::ProtocolError(
                        format!("Got {:?} in answer to {:?}", command, expected),
                    ))),
                    CircuitEvent::Relay { msg, .. } => {
                        log::debug!("Ignoring {:?} while creating", msg.command());
                        None
                    }
                },
                || TorError::HandshakeTimeout(format!("{} to {}", label, router.nickname)),
            )
            .await?;

        let keys = handshake.complete(reply_body(&reply, &handshake))?;
        circuit.push_hop(Hop::new(&keys, Some(router.clone())))?;
        log::debug!("🔑 Hop 0 ({}) keys established", router.nickname);
        Ok(())
    }

    async fn extend(&self, circuit: &Arc<Circuit>, index: usize, router: &Router) -> Result<()> {
        circuit.set_building(index)?;
        let dh = {
            let mut rng = rand::thread_rng();
            DhKeyPair::generate(&mut rng)
        };
        let onion_skin = {
            let mut rng = rand::thread_rng();
            create_onion_skin(&mut rng, &router.onion_key, &dh)?
        };
        log::info!("📡 Extending circuit {} to {}", circuit.serial(), router.nickname);
        circuit.send_relay_early(
            index - 1,
            RelayMsg::Extend {
                address: router.address,
                port: router.or_port,
                onion_skin,
                identity: router.fingerprint,
            },
        )?;

        let reply = circuit
            .wait_event(
                self.settings.circuit_build_timeout(),
                |event| match event {
                    CircuitEvent::Relay {
                        msg: RelayMsg::Extended { reply },
                        hop,
                    } if hop == index - 1 => Some(Ok(reply)),
                    other => {
                        log::debug!("Ignoring {:?} while extending", other);
                        None
                    }
                },
                || TorError::HandshakeTimeout(format!("EXTEND to {}", router.nickname)),
            )
            .await?;

        let keys = dh.complete(&reply)?;
        circuit.push_hop(Hop::new(&keys, Some(router.clone())))?;
        log::info!(
            "✅ Extended circuit {} to {} (now {} hops)",
            circuit.serial(),
            router.nickname,
            index + 1
        );
        Ok(())
    }
}

fn reply_body<'a>(payload: &'a [u8], handshake: &ClientHandshake) -> &'a [u8] {
    let len = match handshake {
        ClientHandshake::Dh(_) => DH_REPLY_LEN,
        ClientHandshake::Fast(_) => FAST_REPLY_LEN,
    };
    &payload[..len.min(payload.len())]
}
