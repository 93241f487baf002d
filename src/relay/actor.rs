use tokio::sync::{mpsc, oneshot};

use super::registry::RoomRegistry;
use super::types::{ConnId, Occupant, Outbound, RelayError, Role, RoomId};

/// Commands sent to the relay actor
pub(crate) enum RelayCommand {
    Join {
        room: RoomId,
        role: Role,
        occupant: Occupant,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Forward {
        room: RoomId,
        sender: ConnId,
        role: Role,
        payload: Outbound,
    },
    Leave {
        room: RoomId,
        conn: ConnId,
        role: Role,
    },
}

/// Single task owning all room state. Commands are applied one at a time, so
/// no admission, routing, or departure ever observes another half-applied.
pub(crate) async fn relay_actor(mut rx: mpsc::Receiver<RelayCommand>) {
    let mut registry = RoomRegistry::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RelayCommand::Join {
                room,
                role,
                occupant,
                reply,
            } => {
                let _ = reply.send(registry.admit(&room, role, occupant));
            }

            RelayCommand::Forward {
                room,
                sender,
                role,
                payload,
            } => {
                registry.forward(&room, sender, role, payload);
            }

            RelayCommand::Leave { room, conn, role } => {
                registry.depart(&room, conn, role);
            }
        }
    }
}

/// Handle to communicate with the relay actor
#[derive(Clone)]
pub struct RelayHandle {
    pub(crate) tx: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    /// Admit a connection into a room under the given role, returning its
    /// generated identity on success
    pub async fn join(
        &self,
        room: RoomId,
        role: Role,
        conn_tx: mpsc::UnboundedSender<Outbound>,
    ) -> Result<ConnId, RelayError> {
        let conn_id = ConnId::generate();
        let occupant = Occupant {
            id: conn_id,
            tx: conn_tx,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(RelayCommand::Join {
                room,
                role,
                occupant,
                reply: reply_tx,
            })
            .await;
        reply_rx
            .await
            .map_err(|_| RelayError::Internal("actor channel closed".to_string()))??;

        Ok(conn_id)
    }

    /// Route one inbound payload from an admitted connection
    pub async fn forward(&self, room: RoomId, sender: ConnId, role: Role, payload: Outbound) {
        let _ = self
            .tx
            .send(RelayCommand::Forward {
                room,
                sender,
                role,
                payload,
            })
            .await;
    }

    /// Remove a connection from its room on close
    pub async fn leave(&self, room: RoomId, conn: ConnId, role: Role) {
        let _ = self.tx.send(RelayCommand::Leave { room, conn, role }).await;
    }
}
