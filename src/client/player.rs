//! Typed playback API on top of [`RpcClient`]

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{CallStream, RpcClient, UnaryCall};
use crate::broadcast::{LastValue, forward};
use crate::protocol::{
    Empty, Method, NowPlayingMsg, PlayQueueIndexMsg, PlayerState, PlayerStateMsg, QueueStateMsg,
    VolumeMsg,
};

/// Pause between a monitor stream ending and its resubscription
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// One method per playback operation
#[derive(Clone)]
pub struct PlayerClient {
    rpc: RpcClient,
}

impl PlayerClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn play(&self) -> UnaryCall<Empty> {
        self.rpc.unary(Method::DoPlay.name(), &Empty {})
    }

    pub fn pause(&self) -> UnaryCall<Empty> {
        self.rpc.unary(Method::DoPause.name(), &Empty {})
    }

    pub fn next(&self) -> UnaryCall<Empty> {
        self.rpc.unary(Method::DoNext.name(), &Empty {})
    }

    pub fn previous(&self) -> UnaryCall<Empty> {
        self.rpc.unary(Method::DoPrevious.name(), &Empty {})
    }

    pub fn play_queue_index(&self, index: u32) -> UnaryCall<Empty> {
        self.rpc
            .unary(Method::DoPlayQueueIndex.name(), &PlayQueueIndexMsg { index })
    }

    /// Returns the volume actually applied
    pub fn set_volume(&self, volume: u32) -> UnaryCall<VolumeMsg> {
        self.rpc.unary(Method::SetVolume.name(), &VolumeMsg { volume })
    }

    pub fn volume(&self) -> UnaryCall<VolumeMsg> {
        self.rpc.unary(Method::GetVolume.name(), &Empty {})
    }

    pub fn now_playing(&self) -> UnaryCall<NowPlayingMsg> {
        self.rpc.unary(Method::GetNowPlaying.name(), &Empty {})
    }

    pub fn player_state(&self) -> UnaryCall<PlayerStateMsg> {
        self.rpc.unary(Method::GetPlayerState.name(), &Empty {})
    }

    pub fn queue_state(&self) -> UnaryCall<QueueStateMsg> {
        self.rpc.unary(Method::GetQueueState.name(), &Empty {})
    }

    pub fn watch_player_state(&self) -> CallStream<PlayerStateMsg> {
        self.rpc.stream(Method::PlayerState.name(), &Empty {})
    }

    pub fn watch_volume(&self) -> CallStream<VolumeMsg> {
        self.rpc.stream(Method::Volume.name(), &Empty {})
    }

    pub fn watch_now_playing(&self) -> CallStream<NowPlayingMsg> {
        self.rpc.stream(Method::NowPlaying.name(), &Empty {})
    }

    pub fn watch_queue_state(&self) -> CallStream<QueueStateMsg> {
        self.rpc.stream(Method::QueueState.name(), &Empty {})
    }

    /// Untyped unary call, for callers that only relay JSON
    pub fn call_raw(&self, method: Method, message: &Value) -> UnaryCall<Value> {
        self.rpc.unary(method.name(), message)
    }

    /// Untyped streaming call
    pub fn watch_raw(&self, method: Method, message: &Value) -> CallStream<Value> {
        self.rpc.stream(method.name(), message)
    }
}

/// Point-in-time view of a [`PlayerMonitor`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlayerSnapshot {
    pub state: Option<PlayerState>,
    pub volume: Option<u32>,
    pub now_playing: Option<NowPlayingMsg>,
}

/// Keeps the latest player state, volume and track, resubscribing whenever a
/// stream ends while the client is still open
pub struct PlayerMonitor {
    state: LastValue<PlayerState>,
    volume: LastValue<u32>,
    now_playing: LastValue<NowPlayingMsg>,
    tasks: Vec<JoinHandle<()>>,
}

impl PlayerMonitor {
    /// Subscribe to the player streams. Must be called inside a tokio runtime.
    pub fn start(player: &PlayerClient) -> Self {
        let state = LastValue::new();
        let volume = LastValue::new();
        let now_playing = LastValue::new();

        let tasks = vec![
            spawn_feed(player.clone(), state.clone(), |p| {
                p.watch_player_state().map(|r| r.map(|m| m.state)).boxed()
            }),
            spawn_feed(player.clone(), volume.clone(), |p| {
                p.watch_volume().map(|r| r.map(|m| m.volume)).boxed()
            }),
            spawn_feed(player.clone(), now_playing.clone(), |p| {
                p.watch_now_playing().boxed()
            }),
        ];

        Self {
            state,
            volume,
            now_playing,
            tasks,
        }
    }

    pub fn state(&self) -> &LastValue<PlayerState> {
        &self.state
    }

    pub fn volume(&self) -> &LastValue<u32> {
        &self.volume
    }

    pub fn now_playing(&self) -> &LastValue<NowPlayingMsg> {
        &self.now_playing
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            state: self.state.get(),
            volume: self.volume.get(),
            now_playing: self.now_playing.get(),
        }
    }

    /// A snapshot every time any of the three values changes
    pub fn changes(&self) -> BoxStream<'static, PlayerSnapshot> {
        let (state, volume, now_playing) =
            (self.state.clone(), self.volume.clone(), self.now_playing.clone());

        stream::select_all([
            self.state.subscribe().map(|_| ()).boxed(),
            self.volume.subscribe().map(|_| ()).boxed(),
            self.now_playing.subscribe().map(|_| ()).boxed(),
        ])
        .map(move |_| PlayerSnapshot {
            state: state.get(),
            volume: volume.get(),
            now_playing: now_playing.get(),
        })
        .boxed()
    }
}

impl Drop for PlayerMonitor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_feed<T, F>(player: PlayerClient, target: LastValue<T>, subscribe: F) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(&PlayerClient) -> BoxStream<'static, Result<T, super::CallError>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let forwarded = forward(subscribe(&player), target.clone()).await;
            if player.rpc().is_closed() {
                break;
            }
            log::debug!("Monitor stream ended after {} items, resubscribing", forwarded);
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use crate::transport::{Backoff, MemoryTransport, Reconnect, memory_connector, memory_pair};
    use futures::SinkExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_typed_calls_use_qualified_names() {
        let (rpc, mut connection) = RpcClient::new("/YtMusic/");
        let (local, mut remote) = memory_pair();
        tokio::spawn(async move { connection.run_session(local).await });
        let player = PlayerClient::new(rpc);

        let call = player.play_queue_index(3);
        let request = Envelope::decode(&remote.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(request.method.as_deref(), Some("/YtMusic/DoPlayQueueIndex"));
        assert_eq!(request.message, Some(json!({"index": 3})));

        let reply = Envelope::reply(request.tx_id, json!({}));
        remote.send(reply.encode().unwrap()).await.unwrap();
        assert_eq!(call.await, Ok(Empty {}));
    }

    #[tokio::test]
    async fn test_monitor_tracks_latest_values() {
        let (rpc, mut connection) = RpcClient::new("/YtMusic/");
        let (local, mut remote) = memory_pair();
        tokio::spawn(async move { connection.run_session(local).await });

        let monitor = PlayerMonitor::start(&PlayerClient::new(rpc));
        let mut changes = monitor.changes();

        let mut subscriptions = Vec::new();
        for _ in 0..3 {
            let request = Envelope::decode(&remote.next().await.unwrap().unwrap()).unwrap();
            subscriptions.push(request);
        }

        for request in &subscriptions {
            let message = match request.method.as_deref() {
                Some("/YtMusic/PlayerState") => json!({"state": "playing"}),
                Some("/YtMusic/Volume") => json!({"volume": 55}),
                Some("/YtMusic/NowPlaying") => json!({"title": "Song", "author": "Band"}),
                other => panic!("unexpected subscription {:?}", other),
            };
            let item = Envelope::reply(request.tx_id.clone(), message);
            remote.send(item.encode().unwrap()).await.unwrap();
        }

        let snapshot = loop {
            let snapshot = changes.next().await.unwrap();
            if snapshot.state.is_some() && snapshot.volume.is_some() && snapshot.now_playing.is_some() {
                break snapshot;
            }
        };
        assert_eq!(snapshot.state, Some(PlayerState::Playing));
        assert_eq!(snapshot.volume, Some(55));
        assert_eq!(snapshot.now_playing.map(|n| n.title), Some("Song".to_string()));
    }

    /// The three subscribe envelopes a monitor sends, ordered by method
    async fn subscriptions(remote: &mut MemoryTransport) -> Vec<Envelope> {
        let mut requests = Vec::new();
        for _ in 0..3 {
            let frame = remote.next().await.unwrap().unwrap();
            requests.push(Envelope::decode(&frame).unwrap());
        }
        requests.sort_by(|a, b| a.method.cmp(&b.method));
        requests
    }

    #[tokio::test]
    async fn test_monitor_resubscribes_after_session_loss() {
        let (rpc, connection) = RpcClient::new("/YtMusic/");
        let (connector, dialer) = memory_connector();
        let retry = Reconnect::new(Backoff::new(Duration::from_millis(1)));
        tokio::spawn(connection.run(connector, retry));

        let _monitor = PlayerMonitor::start(&PlayerClient::new(rpc.clone()));

        let mut first = dialer.dial().unwrap();
        let initial = subscriptions(&mut first).await;
        drop(first);

        let mut second = dialer.dial().unwrap();
        let renewed = tokio::time::timeout(Duration::from_secs(5), subscriptions(&mut second))
            .await
            .unwrap();

        let methods = |requests: &[Envelope]| -> Vec<Option<String>> {
            requests.iter().map(|r| r.method.clone()).collect()
        };
        assert_eq!(methods(&initial), methods(&renewed));
        assert!(renewed.iter().all(|r| initial.iter().all(|i| i.tx_id != r.tx_id)));

        rpc.shutdown();
    }
}
