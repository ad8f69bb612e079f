//! The Hub: the process-wide registry and serialization point for registry
//! mutations and fan-out. Implemented as a single command-processing task,
//! so the single-writer argument behind every registry invariant is
//! structural rather than lock-discipline-dependent.
//!
//! The command loop itself never awaits external I/O: persistence/cache
//! side effects of register/unregister are spawned onto their own tasks so
//! a slow store write can never stall fan-out to an unrelated room.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::{
    connection::Connection,
    model::PublicUserProfile,
    presence::PresenceCache,
    protocol::{OnlineUsersPayload, OutboundFrame, UserJoinedPayload, UserLeftPayload},
    store::PersistenceGateway,
};

struct RegistryEntry {
    conn: Arc<Connection>,
    profile: PublicUserProfile,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct HubState {
    all: HashMap<String, RegistryEntry>,
    by_room: HashMap<i64, HashSet<String>>,
    by_user: HashMap<i64, String>,
}

enum HubCommand {
    Register {
        conn: Arc<Connection>,
        profile: PublicUserProfile,
        tx: mpsc::Sender<String>,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        conn_id: String,
        reply: oneshot::Sender<()>,
    },
    Move {
        conn_id: String,
        new_room_id: i64,
        profile: PublicUserProfile,
        reply: oneshot::Sender<()>,
    },
    Broadcast {
        room_id: i64,
        frame: OutboundFrame,
        reply: oneshot::Sender<()>,
    },
    OnlineUsers {
        room_id: i64,
        reply: oneshot::Sender<Vec<PublicUserProfile>>,
    },
}

/// A cheap, cloneable handle to the running Hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Register a newly-attached connection. Evicts any existing connection
    /// for the same `user_id` first (the duplicate-attach policy).
    pub async fn register(
        &self,
        conn: Arc<Connection>,
        profile: PublicUserProfile,
        tx: mpsc::Sender<String>,
    ) {
        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(HubCommand::Register {
                conn,
                profile,
                tx,
                reply,
            })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Idempotent: a second call for an already-absent `conn_id` is a no-op.
    pub async fn unregister(&self, conn_id: impl Into<String>) {
        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(HubCommand::Unregister {
                conn_id: conn_id.into(),
                reply,
            })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Atomically move a connection to a new room: the unregister-old /
    /// mutate / register-new sequence collapsed into one Hub-serialized
    /// step, so no broadcast can ever observe the connection indexed under
    /// a room that disagrees with its `room_id`.
    pub async fn move_room(&self, conn_id: impl Into<String>, new_room_id: i64, profile: PublicUserProfile) {
        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(HubCommand::Move {
                conn_id: conn_id.into(),
                new_room_id,
                profile,
                reply,
            })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    pub async fn broadcast(&self, room_id: i64, frame: OutboundFrame) {
        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(HubCommand::Broadcast {
                room_id,
                frame,
                reply,
            })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    pub async fn online_users(&self, room_id: i64) -> Vec<PublicUserProfile> {
        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(HubCommand::OnlineUsers { room_id, reply })
            .is_ok()
        {
            done.await.unwrap_or_default()
        } else {
            Vec::new()
        }
    }
}

/// Shared collaborators the Hub hands off side effects to; never awaited
/// from within the command loop itself.
struct HubDeps {
    persistence: Arc<dyn PersistenceGateway>,
    presence: Arc<dyn PresenceCache>,
}

/// Spawn the Hub's command-processing task and return a handle to it.
pub fn spawn(
    persistence: Arc<dyn PersistenceGateway>,
    presence: Arc<dyn PresenceCache>,
) -> HubHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<HubCommand>();
    let deps = Arc::new(HubDeps {
        persistence,
        presence,
    });

    tokio::spawn(async move {
        let mut state = HubState::default();
        while let Some(cmd) = rx.recv().await {
            match cmd {
                HubCommand::Register {
                    conn,
                    profile,
                    tx,
                    reply,
                } => {
                    do_register(&mut state, conn, profile, tx, &deps);
                    let _ = reply.send(());
                },
                HubCommand::Unregister { conn_id, reply } => {
                    do_unregister(&mut state, &conn_id, &deps, true);
                    let _ = reply.send(());
                },
                HubCommand::Move {
                    conn_id,
                    new_room_id,
                    profile,
                    reply,
                } => {
                    do_move(&mut state, &conn_id, new_room_id, profile, &deps);
                    let _ = reply.send(());
                },
                HubCommand::Broadcast {
                    room_id,
                    frame,
                    reply,
                } => {
                    fan_out(&mut state, room_id, &frame, &deps);
                    let _ = reply.send(());
                },
                HubCommand::OnlineUsers { room_id, reply } => {
                    let profiles = online_profiles(&state, room_id);
                    let _ = reply.send(profiles);
                },
            }
        }
    });

    HubHandle { tx }
}

fn online_profiles(state: &HubState, room_id: i64) -> Vec<PublicUserProfile> {
    state
        .by_room
        .get(&room_id)
        .map(|ids| {
            ids.iter()
                .filter_map(|id| state.all.get(id).map(|e| e.profile.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn do_register(
    state: &mut HubState,
    conn: Arc<Connection>,
    profile: PublicUserProfile,
    tx: mpsc::Sender<String>,
    deps: &Arc<HubDeps>,
) {
    let conn_id = conn.id.clone();
    let user_id = conn.user_id;
    let room_id = conn.room_id();

    // Duplicate-attach policy: evict any existing connection for this user
    // first. The offline presence writes are suppressed here (the register
    // below immediately writes the user back online) so the two detached
    // tasks can't race and leave the durable/cache state stuck offline.
    if let Some(old_conn_id) = state.by_user.get(&user_id).cloned()
        && old_conn_id != conn_id
    {
        do_unregister(state, &old_conn_id, deps, false);
    }

    state
        .by_room
        .entry(room_id)
        .or_default()
        .insert(conn_id.clone());
    state.by_user.insert(user_id, conn_id.clone());
    state.all.insert(
        conn_id.clone(),
        RegistryEntry {
            conn,
            profile: profile.clone(),
            tx: tx.clone(),
        },
    );

    fan_out(
        state,
        room_id,
        &OutboundFrame::UserJoined {
            room_id,
            data: UserJoinedPayload { user: profile },
        },
        deps,
    );

    // Synthetic online_users frame sent directly to the new connection only.
    let online = online_profiles(state, room_id);
    if let Ok(json) = (OutboundFrame::OnlineUsers {
        room_id,
        data: OnlineUsersPayload { users: online },
    })
    .to_json()
    {
        let _ = tx.try_send(json);
    }

    let persistence = deps.persistence.clone();
    let presence = deps.presence.clone();
    tokio::spawn(async move {
        presence.set_user_online(user_id, room_id).await;
        if let Err(e) = persistence.set_user_presence(user_id, true, None).await {
            warn!(user_id, error = %e, "failed to record presence online");
        }
    });
}

/// Removes `conn_id` from every map and closes its outbound queue. No-op
/// (and no `user_left` broadcast) if the connection is already gone: this
/// is what makes `unregister` idempotent.
///
/// `write_presence` is `false` only when this unregister is the eviction
/// half of a duplicate-attach replacement for the same user: the caller is
/// about to write that user back online, so the offline write is skipped
/// rather than raced against it.
fn do_unregister(state: &mut HubState, conn_id: &str, deps: &Arc<HubDeps>, write_presence: bool) {
    let Some(entry) = state.all.remove(conn_id) else {
        return;
    };

    let room_id = entry.conn.room_id();
    let user_id = entry.conn.user_id;

    if let Some(set) = state.by_room.get_mut(&room_id) {
        set.remove(conn_id);
        if set.is_empty() {
            state.by_room.remove(&room_id);
        }
    }
    if state.by_user.get(&user_id).map(String::as_str) == Some(conn_id) {
        state.by_user.remove(&user_id);
    }

    // Dropping the only outstanding Sender closes the channel; the writer
    // task observes `recv() == None` and exits, closing the socket.
    drop(entry.tx);

    fan_out(
        state,
        room_id,
        &OutboundFrame::UserLeft {
            room_id,
            data: UserLeftPayload { user_id },
        },
        deps,
    );

    if write_presence {
        let persistence = deps.persistence.clone();
        let presence = deps.presence.clone();
        tokio::spawn(async move {
            presence.set_user_offline(user_id).await;
            if let Err(e) = persistence
                .set_user_presence(user_id, false, Some(chrono::Utc::now()))
                .await
            {
                warn!(user_id, error = %e, "failed to record presence offline");
            }
        });
    }
}

fn do_move(
    state: &mut HubState,
    conn_id: &str,
    new_room_id: i64,
    profile: PublicUserProfile,
    deps: &Arc<HubDeps>,
) {
    let Some((user_id, old_room_id)) = state
        .all
        .get(conn_id)
        .map(|e| (e.conn.user_id, e.conn.room_id()))
    else {
        return;
    };
    if old_room_id == new_room_id {
        return;
    }

    if let Some(set) = state.by_room.get_mut(&old_room_id) {
        set.remove(conn_id);
        if set.is_empty() {
            state.by_room.remove(&old_room_id);
        }
    }
    fan_out(
        state,
        old_room_id,
        &OutboundFrame::UserLeft {
            room_id: old_room_id,
            data: UserLeftPayload { user_id },
        },
        deps,
    );

    if let Some(entry) = state.all.get_mut(conn_id) {
        entry.conn.set_room_id(new_room_id);
        entry.profile = profile.clone();
    }
    state
        .by_room
        .entry(new_room_id)
        .or_default()
        .insert(conn_id.to_string());

    fan_out(
        state,
        new_room_id,
        &OutboundFrame::UserJoined {
            room_id: new_room_id,
            data: UserJoinedPayload { user: profile },
        },
        deps,
    );

    let online = online_profiles(state, new_room_id);
    if let Some(entry) = state.all.get(conn_id)
        && let Ok(json) = (OutboundFrame::OnlineUsers {
            room_id: new_room_id,
            data: OnlineUsersPayload { users: online },
        })
        .to_json()
    {
        let _ = entry.tx.try_send(json);
    }

    let presence = deps.presence.clone();
    tokio::spawn(async move {
        presence.set_user_online(user_id, new_room_id).await;
    });
}

/// Serialize `frame` once and attempt a non-blocking enqueue to every
/// connection currently in `room_id`. A recipient whose queue is full or
/// closed is evicted; eviction never halts, retries, or reorders delivery
/// to the rest.
fn fan_out(state: &mut HubState, room_id: i64, frame: &OutboundFrame, deps: &Arc<HubDeps>) {
    let Ok(json) = frame.to_json() else {
        warn!("failed to serialize outbound frame");
        return;
    };
    let Some(recipients) = state.by_room.get(&room_id).cloned() else {
        return;
    };

    let mut to_evict = Vec::new();
    for conn_id in recipients {
        let Some(entry) = state.all.get(&conn_id) else {
            continue;
        };
        if entry.tx.try_send(json.clone()).is_err() {
            to_evict.push(conn_id);
        }
    }

    for conn_id in to_evict {
        do_unregister(state, &conn_id, deps, true);
    }
}
