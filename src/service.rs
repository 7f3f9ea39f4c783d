//! Playback service contract and its binding onto a [`Dispatcher`]

mod simulated;

use futures::StreamExt;
use futures::stream::BoxStream;
use std::future::Future;
use std::sync::Arc;

use crate::protocol::{
    Empty, Method, NowPlayingMsg, PlayQueueIndexMsg, PlayerState, PlayerStateMsg, QueueStateMsg,
    VolumeMsg,
};
use crate::server::{Dispatcher, HandlerError};

pub use simulated::{SimulatedPlayer, Track};

pub type ServiceResult<T> = Result<T, HandlerError>;
pub type ServiceStream<T> = BoxStream<'static, ServiceResult<T>>;

/// Something that can be driven like the music player
pub trait PlayerService: Send + Sync + 'static {
    fn play(&self) -> impl Future<Output = ServiceResult<()>> + Send;
    fn pause(&self) -> impl Future<Output = ServiceResult<()>> + Send;
    fn next(&self) -> impl Future<Output = ServiceResult<()>> + Send;
    fn previous(&self) -> impl Future<Output = ServiceResult<()>> + Send;
    fn play_queue_index(&self, index: u32) -> impl Future<Output = ServiceResult<()>> + Send;

    /// Apply a volume and return the value actually in effect
    fn set_volume(&self, volume: u32) -> impl Future<Output = ServiceResult<u32>> + Send;
    fn volume(&self) -> impl Future<Output = ServiceResult<u32>> + Send;
    fn now_playing(&self) -> impl Future<Output = ServiceResult<NowPlayingMsg>> + Send;
    fn player_state(&self) -> impl Future<Output = ServiceResult<PlayerState>> + Send;
    fn queue_state(&self) -> impl Future<Output = ServiceResult<QueueStateMsg>> + Send;

    /// Streams start with the current value, then follow changes
    fn watch_player_state(&self) -> ServiceStream<PlayerState>;
    fn watch_volume(&self) -> ServiceStream<u32>;
    fn watch_now_playing(&self) -> ServiceStream<NowPlayingMsg>;
    fn watch_queue_state(&self) -> ServiceStream<QueueStateMsg>;
}

/// Register every playback operation of `service` on `dispatcher`
pub fn register_player_service<S: PlayerService>(dispatcher: &mut Dispatcher, service: Arc<S>) {
    let svc = Arc::clone(&service);
    dispatcher.register_unary(Method::DoPlay.name(), move |_: Empty| {
        let svc = Arc::clone(&svc);
        async move { svc.play().await.map(|()| Empty {}) }
    });

    let svc = Arc::clone(&service);
    dispatcher.register_unary(Method::DoPause.name(), move |_: Empty| {
        let svc = Arc::clone(&svc);
        async move { svc.pause().await.map(|()| Empty {}) }
    });

    let svc = Arc::clone(&service);
    dispatcher.register_unary(Method::DoNext.name(), move |_: Empty| {
        let svc = Arc::clone(&svc);
        async move { svc.next().await.map(|()| Empty {}) }
    });

    let svc = Arc::clone(&service);
    dispatcher.register_unary(Method::DoPrevious.name(), move |_: Empty| {
        let svc = Arc::clone(&svc);
        async move { svc.previous().await.map(|()| Empty {}) }
    });

    let svc = Arc::clone(&service);
    dispatcher.register_unary(Method::DoPlayQueueIndex.name(), move |req: PlayQueueIndexMsg| {
        let svc = Arc::clone(&svc);
        async move { svc.play_queue_index(req.index).await.map(|()| Empty {}) }
    });

    let svc = Arc::clone(&service);
    dispatcher.register_unary(Method::SetVolume.name(), move |req: VolumeMsg| {
        let svc = Arc::clone(&svc);
        async move { Ok(VolumeMsg { volume: svc.set_volume(req.volume).await? }) }
    });

    let svc = Arc::clone(&service);
    dispatcher.register_unary(Method::GetVolume.name(), move |_: Empty| {
        let svc = Arc::clone(&svc);
        async move { Ok(VolumeMsg { volume: svc.volume().await? }) }
    });

    let svc = Arc::clone(&service);
    dispatcher.register_unary(Method::GetNowPlaying.name(), move |_: Empty| {
        let svc = Arc::clone(&svc);
        async move { svc.now_playing().await }
    });

    let svc = Arc::clone(&service);
    dispatcher.register_unary(Method::GetPlayerState.name(), move |_: Empty| {
        let svc = Arc::clone(&svc);
        async move { Ok(PlayerStateMsg { state: svc.player_state().await? }) }
    });

    let svc = Arc::clone(&service);
    dispatcher.register_unary(Method::GetQueueState.name(), move |_: Empty| {
        let svc = Arc::clone(&svc);
        async move { svc.queue_state().await }
    });

    let svc = Arc::clone(&service);
    dispatcher.register_stream(Method::PlayerState.name(), move |_: Empty| {
        svc.watch_player_state()
            .map(|state| state.map(|state| PlayerStateMsg { state }))
    });

    let svc = Arc::clone(&service);
    dispatcher.register_stream(Method::Volume.name(), move |_: Empty| {
        svc.watch_volume()
            .map(|volume| volume.map(|volume| VolumeMsg { volume }))
    });

    let svc = Arc::clone(&service);
    dispatcher.register_stream(Method::NowPlaying.name(), move |_: Empty| svc.watch_now_playing());

    dispatcher.register_stream(Method::QueueState.name(), move |_: Empty| service.watch_queue_state());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CallError, PlayerClient, RpcClient, SessionEnd};
    use crate::protocol::DEFAULT_SERVICE_PREFIX;
    use crate::transport::memory_pair;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Bridge {
        player: PlayerClient,
        client_session: JoinHandle<SessionEnd>,
        server_session: JoinHandle<crate::server::SessionSummary>,
    }

    fn bridge(service: SimulatedPlayer) -> Bridge {
        let mut dispatcher = Dispatcher::new(DEFAULT_SERVICE_PREFIX);
        register_player_service(&mut dispatcher, Arc::new(service));

        let (rpc, mut connection) = RpcClient::new(DEFAULT_SERVICE_PREFIX);
        let (client_end, server_end) = memory_pair();
        Bridge {
            player: PlayerClient::new(rpc),
            client_session: tokio::spawn(async move { connection.run_session(client_end).await }),
            server_session: tokio::spawn(async move { dispatcher.serve_session(server_end).await }),
        }
    }

    #[test]
    fn test_every_method_is_registered() {
        let mut dispatcher = Dispatcher::default();
        register_player_service(&mut dispatcher, Arc::new(SimulatedPlayer::demo()));

        for method in Method::ALL {
            let handler = dispatcher.resolve(method.name()).ok().flatten();
            let handler = handler.unwrap_or_else(|| panic!("{} not registered", method));
            assert_eq!(handler.is_streaming(), method.is_streaming(), "{}", method);
        }
    }

    #[tokio::test]
    async fn test_set_volume_round_trip() {
        let bridge = bridge(SimulatedPlayer::demo());

        let applied = bridge.player.set_volume(42).await.unwrap();
        assert_eq!(applied, VolumeMsg { volume: 42 });
        assert_eq!(bridge.player.volume().await.unwrap().volume, 42);

        // Out-of-range volumes are clamped rather than rejected
        assert_eq!(bridge.player.set_volume(250).await.unwrap().volume, 100);
    }

    #[tokio::test]
    async fn test_player_state_stream_follows_play_and_pause() {
        let bridge = bridge(SimulatedPlayer::demo());
        let mut states = bridge.player.watch_player_state();

        assert_eq!(
            states.next().await.unwrap().unwrap().state,
            PlayerState::Unstarted
        );

        bridge.player.play().await.unwrap();
        bridge.player.pause().await.unwrap();

        assert_eq!(states.next().await.unwrap().unwrap().state, PlayerState::Playing);
        assert_eq!(states.next().await.unwrap().unwrap().state, PlayerState::Paused);
        assert_eq!(states.current().map(|m| m.state), Some(PlayerState::Paused));
    }

    #[tokio::test]
    async fn test_queue_navigation() {
        let bridge = bridge(SimulatedPlayer::demo());
        let mut now_playing = bridge.player.watch_now_playing();
        let first = now_playing.next().await.unwrap().unwrap();

        bridge.player.next().await.unwrap();
        let second = bridge.player.now_playing().await.unwrap();
        assert_ne!(first.title, second.title);
        assert_eq!(bridge.player.queue_state().await.unwrap().current_index, Some(1));

        bridge.player.play_queue_index(0).await.unwrap();
        assert_eq!(bridge.player.now_playing().await.unwrap().title, first.title);

        let err = bridge.player.play_queue_index(99).await.unwrap_err();
        assert!(matches!(err, CallError::Remote(message) if message.contains("99")));
    }

    #[tokio::test]
    async fn test_transport_loss_cancels_open_stream() {
        let bridge = bridge(SimulatedPlayer::demo());
        let mut volumes = bridge.player.watch_volume();
        assert!(volumes.next().await.unwrap().is_ok());

        // Closing the server side ends both sessions
        bridge.server_session.abort();
        let end = tokio::time::timeout(Duration::from_secs(5), bridge.client_session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Closed);

        assert_eq!(volumes.next().await, Some(Err(CallError::Cancelled)));
        assert_eq!(volumes.next().await, None);
    }
}
