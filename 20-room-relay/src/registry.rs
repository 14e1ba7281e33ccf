//! Room and session tables shared by handshake tasks and the relay loop.
//!
//! Both tables live behind one async mutex so every operation, including the
//! lookup-then-insert in [`Registry::create_room`] and [`Registry::join_room`],
//! is a single critical section. Nothing in here performs I/O, so the lock is
//! never held across a network call.

use std::{collections::HashMap, net::IpAddr, time::Duration};

use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

use crate::{error::ChatError, protocol::Token};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub username: String,
    pub address: IpAddr,
    pub room_name: String,
    pub last_seen: Instant,
}

/// Read-only copy of a room handed out to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub host: Token,
    pub members: Vec<Token>,
}

/// A member removed from a room, either by `leave` or by the idle sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_name: String,
    pub token: Token,
    pub username: String,
}

#[derive(Default)]
pub struct Registry {
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    rooms: HashMap<String, Room>,
    sessions: HashMap<Token, Session>,
}

struct Room {
    host: Token,
    members: Vec<Token>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_room(
        &self,
        name: &str,
        username: &str,
        address: IpAddr,
    ) -> Result<Token, ChatError> {
        let mut tables = self.tables.lock().await;
        if tables.rooms.contains_key(name) {
            return Err(ChatError::RoomExists(name.to_string()));
        }

        let token = tables.open_session(name, username, address);
        tables.rooms.insert(
            name.to_string(),
            Room {
                host: token.clone(),
                members: vec![token.clone()],
            },
        );
        debug!(room = name, username, "room created");
        Ok(token)
    }

    pub async fn join_room(
        &self,
        name: &str,
        username: &str,
        address: IpAddr,
    ) -> Result<Token, ChatError> {
        let mut tables = self.tables.lock().await;
        if !tables.rooms.contains_key(name) {
            return Err(ChatError::RoomNotFound(name.to_string()));
        }

        let token = tables.open_session(name, username, address);
        if let Some(room) = tables.rooms.get_mut(name) {
            room.members.push(token.clone());
        }
        debug!(room = name, username, "member joined");
        Ok(token)
    }

    /// Members of `room_name` with their registered addresses, in join order.
    pub async fn resolve_members(&self, room_name: &str) -> Vec<(Token, IpAddr)> {
        let tables = self.tables.lock().await;
        let Some(room) = tables.rooms.get(room_name) else {
            return Vec::new();
        };

        room.members
            .iter()
            .filter_map(|token| {
                tables
                    .sessions
                    .get(token)
                    .map(|session| (token.clone(), session.address))
            })
            .collect()
    }

    pub async fn is_member(&self, room_name: &str, token: &Token) -> bool {
        let tables = self.tables.lock().await;
        tables
            .rooms
            .get(room_name)
            .is_some_and(|room| room.members.contains(token))
    }

    /// Removes `token` from `room_name`. A room left empty is deleted, and the
    /// session record goes with the membership since a token belongs to one room.
    pub async fn remove_member(&self, room_name: &str, token: &Token) -> Option<Session> {
        let mut tables = self.tables.lock().await;
        tables.detach(room_name, token)
    }

    pub async fn lookup_username(&self, token: &Token) -> Option<String> {
        let tables = self.tables.lock().await;
        tables
            .sessions
            .get(token)
            .map(|session| session.username.clone())
    }

    /// Marks the session as alive. Returns false for unknown tokens.
    pub async fn touch(&self, token: &Token) -> bool {
        let mut tables = self.tables.lock().await;
        match tables.sessions.get_mut(token) {
            Some(session) => {
                session.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Drops every session that has been silent for longer than `max_idle` as of `now`.
    pub async fn reap_idle(&self, max_idle: Duration, now: Instant) -> Vec<Departure> {
        let mut tables = self.tables.lock().await;
        let expired: Vec<(Token, String)> = tables
            .sessions
            .iter()
            .filter(|(_, session)| now.saturating_duration_since(session.last_seen) > max_idle)
            .map(|(token, session)| (token.clone(), session.room_name.clone()))
            .collect();

        expired
            .into_iter()
            .filter_map(|(token, room_name)| {
                tables.detach(&room_name, &token).map(|session| Departure {
                    room_name,
                    token,
                    username: session.username,
                })
            })
            .collect()
    }

    pub async fn room(&self, name: &str) -> Option<RoomSnapshot> {
        let tables = self.tables.lock().await;
        tables.rooms.get(name).map(|room| RoomSnapshot {
            host: room.host.clone(),
            members: room.members.clone(),
        })
    }

    pub async fn session(&self, token: &Token) -> Option<Session> {
        let tables = self.tables.lock().await;
        tables.sessions.get(token).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.tables.lock().await.rooms.len()
    }

    pub async fn session_count(&self) -> usize {
        self.tables.lock().await.sessions.len()
    }
}

impl Tables {
    fn open_session(&mut self, room_name: &str, username: &str, address: IpAddr) -> Token {
        let mut token = Token::generate();
        while self.sessions.contains_key(&token) {
            token = Token::generate();
        }

        self.sessions.insert(
            token.clone(),
            Session {
                username: username.to_string(),
                address,
                room_name: room_name.to_string(),
                last_seen: Instant::now(),
            },
        );
        token
    }

    fn detach(&mut self, room_name: &str, token: &Token) -> Option<Session> {
        let room = self.rooms.get_mut(room_name)?;
        let position = room.members.iter().position(|member| member == token)?;
        room.members.remove(position);

        if room.members.is_empty() {
            self.rooms.remove(room_name);
            debug!(room = room_name, "room closed");
        } else if room.host == *token {
            // Host role passes to the longest-standing remaining member.
            room.host = room.members[0].clone();
        }

        self.sessions.remove(token)
    }
}
