use super::RoomAccessValidator;
use crate::error::RoomAccessError;
use crate::peer::{Peer, PeerId};
use dashmap::DashMap;
use master_protocol::{Properties, RoomAccessPacket};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A bearer ticket granting one entry into one room.
#[derive(Debug, Clone)]
pub struct RoomAccessTicket {
    pub room_id: i32,
    pub token: String,
    pub username: String,
    pub requester: PeerId,
    pub password: String,
    pub properties: Properties,
    pub created_at: Instant,
    pub consumed: bool,
}

/// Outcome of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedAccess {
    pub username: String,
    pub peer_id: PeerId,
}

/// Issues and validates room access tickets.
pub struct RoomAccessAuthority {
    tickets: DashMap<String, RoomAccessTicket>,
    validator: Arc<dyn RoomAccessValidator>,
}

impl RoomAccessAuthority {
    pub fn new(validator: Arc<dyn RoomAccessValidator>) -> Self {
        Self {
            tickets: DashMap::new(),
            validator,
        }
    }

    pub fn validator(&self) -> &Arc<dyn RoomAccessValidator> {
        &self.validator
    }

    /// Issues a ticket for `room_id` bound to the requester's username.
    pub fn request_access(
        &self,
        room_id: i32,
        password: &str,
        properties: &Properties,
        requester: &Peer,
    ) -> Result<RoomAccessPacket, RoomAccessError> {
        if !requester.is_connected() {
            return Err(RoomAccessError::NotConnected);
        }
        self.validator
            .validate(room_id, password, properties, requester)
            .map_err(|e| {
                debug!(room_id, peer = requester.id(), "Room access refused: {}", e);
                e
            })?;

        let token = Uuid::new_v4().to_string();
        let username = requester.username();
        self.tickets.insert(
            token.clone(),
            RoomAccessTicket {
                room_id,
                token: token.clone(),
                username: username.clone(),
                requester: requester.id(),
                password: password.to_string(),
                properties: properties.clone(),
                created_at: Instant::now(),
                consumed: false,
            },
        );
        info!("🎟️ Issued access ticket for room {} to {}", room_id, username);

        Ok(RoomAccessPacket {
            room_id,
            token,
            username,
        })
    }

    /// Checks and consumes a ticket.
    ///
    /// Fails with `Unauthorized` when the token is unknown, already used,
    /// issued for another room, or bound to another user (checked only
    /// when `username` is non-empty). A failed check does not consume it.
    pub fn validate_ticket(
        &self,
        token: &str,
        room_id: i32,
        username: &str,
    ) -> Result<ValidatedAccess, RoomAccessError> {
        // The entry guard holds the shard lock, so check-and-consume is atomic.
        let Some(mut ticket) = self.tickets.get_mut(token) else {
            return Err(RoomAccessError::Unauthorized("Invalid access token".into()));
        };

        if ticket.consumed {
            warn!(room_id, "Rejected reuse of a consumed access ticket");
            return Err(RoomAccessError::Unauthorized("Access token already used".into()));
        }
        if ticket.room_id != room_id {
            return Err(RoomAccessError::Unauthorized(
                "Access token issued for another room".into(),
            ));
        }
        if !username.is_empty() && ticket.username != username {
            return Err(RoomAccessError::Unauthorized(
                "Access token issued to another user".into(),
            ));
        }

        ticket.consumed = true;
        debug!(room_id, username = %ticket.username, "Access ticket consumed");
        Ok(ValidatedAccess {
            username: ticket.username.clone(),
            peer_id: ticket.requester,
        })
    }

    /// Drops consumed tickets, and unconsumed ones older than `ttl`.
    pub fn purge(&self, ttl: Option<Duration>) -> usize {
        let before = self.tickets.len();
        self.tickets.retain(|_, ticket| {
            if ticket.consumed {
                return false;
            }
            match ttl {
                Some(ttl) => ticket.created_at.elapsed() < ttl,
                None => true,
            }
        });
        before.saturating_sub(self.tickets.len())
    }

    /// Drops every ticket for `room_id`.
    pub fn revoke_room(&self, room_id: i32) -> usize {
        let before = self.tickets.len();
        self.tickets.retain(|_, ticket| ticket.room_id != room_id);
        before.saturating_sub(self.tickets.len())
    }

    pub fn ticket(&self, token: &str) -> Option<RoomAccessTicket> {
        self.tickets.get(token).map(|ticket| ticket.clone())
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::UserExtension;

    struct AllowAll;

    impl RoomAccessValidator for AllowAll {
        fn validate(&self, _: i32, _: &str, _: &Properties, _: &Peer) -> Result<(), RoomAccessError> {
            Ok(())
        }
    }

    fn alice() -> Arc<Peer> {
        let (peer, rx) = Peer::new(5, None);
        std::mem::drop(rx);
        peer.extensions().user = Some(UserExtension {
            username: "alice".into(),
            token: String::new(),
        });
        peer
    }

    #[test]
    fn ticket_validates_exactly_once() {
        let authority = RoomAccessAuthority::new(Arc::new(AllowAll));
        let ticket = authority
            .request_access(7, "x", &Properties::new(), &alice())
            .unwrap();
        assert_eq!(ticket.username, "alice");

        let access = authority.validate_ticket(&ticket.token, 7, "alice").unwrap();
        assert_eq!(access, ValidatedAccess { username: "alice".into(), peer_id: 5 });

        for (room, name) in [(7, "alice"), (7, ""), (8, "bob")] {
            assert!(matches!(
                authority.validate_ticket(&ticket.token, room, name),
                Err(RoomAccessError::Unauthorized(_))
            ));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_validations_consume_a_ticket_once() {
        let authority = Arc::new(RoomAccessAuthority::new(Arc::new(AllowAll)));
        let peer = alice();

        for _ in 0..200 {
            let ticket = authority
                .request_access(7, "", &Properties::new(), &peer)
                .unwrap();
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let attempts: Vec<_> = (0..2)
                .map(|_| {
                    let authority = authority.clone();
                    let barrier = barrier.clone();
                    let token = ticket.token.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        authority.validate_ticket(&token, 7, "alice")
                    })
                })
                .collect();

            let mut accepted = 0;
            for attempt in attempts {
                match attempt.await.unwrap() {
                    Ok(access) => {
                        assert_eq!(access.username, "alice");
                        accepted += 1;
                    }
                    Err(e) => assert!(matches!(e, RoomAccessError::Unauthorized(_))),
                }
            }
            assert_eq!(accepted, 1, "exactly one validation must win");
        }
    }

    #[test]
    fn mismatches_do_not_consume() {
        let authority = RoomAccessAuthority::new(Arc::new(AllowAll));
        let ticket = authority
            .request_access(7, "", &Properties::new(), &alice())
            .unwrap();

        assert!(authority.validate_ticket(&ticket.token, 8, "alice").is_err());
        assert!(authority.validate_ticket(&ticket.token, 7, "bob").is_err());
        assert!(authority.validate_ticket("not-a-token", 7, "alice").is_err());

        // Empty username skips the user check.
        assert!(authority.validate_ticket(&ticket.token, 7, "").is_ok());
    }

    #[test]
    fn disconnected_requester_gets_no_ticket() {
        let authority = RoomAccessAuthority::new(Arc::new(AllowAll));
        let peer = alice();
        peer.disconnect();
        assert_eq!(
            authority.request_access(7, "", &Properties::new(), &peer),
            Err(RoomAccessError::NotConnected)
        );
        assert!(authority.is_empty());
    }

    #[test]
    fn purge_drops_consumed_and_expired() {
        let authority = RoomAccessAuthority::new(Arc::new(AllowAll));
        let peer = alice();
        let used = authority.request_access(1, "", &Properties::new(), &peer).unwrap();
        let fresh = authority.request_access(2, "", &Properties::new(), &peer).unwrap();
        authority.validate_ticket(&used.token, 1, "").unwrap();

        assert_eq!(authority.purge(None), 1);
        assert!(authority.ticket(&fresh.token).is_some());

        assert_eq!(authority.purge(Some(Duration::ZERO)), 1);
        assert!(authority.is_empty());
    }

    #[test]
    fn tokens_are_unique() {
        let authority = RoomAccessAuthority::new(Arc::new(AllowAll));
        let peer = alice();
        let a = authority.request_access(1, "", &Properties::new(), &peer).unwrap();
        let b = authority.request_access(1, "", &Properties::new(), &peer).unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(authority.revoke_room(1), 2);
    }
}
