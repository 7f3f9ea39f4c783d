//! In-memory player used by `playbridge serve` and the tests

use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{PlayerService, ServiceResult, ServiceStream};
use crate::broadcast::LastValue;
use crate::protocol::{NowPlayingMsg, PlayerState, QueueItem, QueueStateMsg};
use crate::server::HandlerError;

const MAX_VOLUME: u32 = 100;
const DEFAULT_VOLUME: u32 = 50;

/// A queue entry
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Track {
    pub title: String,
    pub author: String,
    pub cover_url: String,
    pub thumbnail_url: String,
}

impl Track {
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            ..Default::default()
        }
    }

    fn queue_item(&self) -> QueueItem {
        QueueItem {
            title: self.title.clone(),
            author: self.author.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
        }
    }

    fn now_playing(&self) -> NowPlayingMsg {
        NowPlayingMsg {
            title: self.title.clone(),
            author: self.author.clone(),
            cover_url: self.cover_url.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
        }
    }
}

struct Model {
    tracks: Vec<Track>,
    current: Option<usize>,
    volume: u32,
    state: PlayerState,
}

impl Model {
    fn now_playing(&self) -> NowPlayingMsg {
        self.current
            .and_then(|index| self.tracks.get(index))
            .map(Track::now_playing)
            .unwrap_or_default()
    }

    fn queue_state(&self) -> QueueStateMsg {
        QueueStateMsg {
            current_index: self.current.map(|index| index as u32),
            items: self.tracks.iter().map(Track::queue_item).collect(),
        }
    }
}

struct Inner {
    model: Mutex<Model>,
    state: LastValue<PlayerState>,
    volume: LastValue<u32>,
    now_playing: LastValue<NowPlayingMsg>,
    queue: LastValue<QueueStateMsg>,
}

/// Player with a fixed queue that reacts to commands immediately
#[derive(Clone)]
pub struct SimulatedPlayer {
    inner: Arc<Inner>,
}

impl SimulatedPlayer {
    pub fn new(tracks: Vec<Track>) -> Self {
        let model = Model {
            current: if tracks.is_empty() { None } else { Some(0) },
            tracks,
            volume: DEFAULT_VOLUME,
            state: PlayerState::Unstarted,
        };

        let inner = Inner {
            state: LastValue::with_value(model.state),
            volume: LastValue::with_value(model.volume),
            now_playing: LastValue::with_value(model.now_playing()),
            queue: LastValue::with_value(model.queue_state()),
            model: Mutex::new(model),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// A short canned queue
    pub fn demo() -> Self {
        Self::new(vec![
            Track::new("Midnight City", "M83"),
            Track::new("Digital Love", "Daft Punk"),
            Track::new("Kids", "MGMT"),
        ])
    }

    fn model(&self) -> MutexGuard<'_, Model> {
        self.inner.model.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish state, track and queue. The track is re-emitted on every state
    /// change even when it did not change.
    fn publish_playback(&self, model: &Model) {
        self.inner.state.publish(model.state);
        self.inner.now_playing.publish(model.now_playing());
        self.inner.queue.publish(model.queue_state());
    }

    fn set_state(&self, state: PlayerState) {
        let mut model = self.model();
        model.state = state;
        self.publish_playback(&model);
    }

    /// Apply a raw state code as reported by the embedded player.
    ///
    /// Returns `false` for codes that do not map to a state.
    pub fn report_state_code(&self, code: i32) -> bool {
        match PlayerState::from_code(code) {
            Some(state) => {
                self.set_state(state);
                true
            }
            None => {
                log::debug!("Ignoring unknown player state code {}", code);
                false
            }
        }
    }

    fn jump(&self, index: usize) -> ServiceResult<()> {
        let mut model = self.model();
        if index >= model.tracks.len() {
            return Err(HandlerError::failed(format!(
                "Queue index {} out of range ({} tracks)",
                index,
                model.tracks.len()
            )));
        }
        model.current = Some(index);
        model.state = PlayerState::Playing;
        self.publish_playback(&model);
        Ok(())
    }
}

fn follow<T: Clone + Send + 'static>(value: &LastValue<T>) -> ServiceStream<T> {
    value.subscribe().map(Ok).boxed()
}

impl PlayerService for SimulatedPlayer {
    async fn play(&self) -> ServiceResult<()> {
        let mut model = self.model();
        if model.current.is_none() {
            return Err(HandlerError::failed("Queue is empty"));
        }
        model.state = PlayerState::Playing;
        self.publish_playback(&model);
        Ok(())
    }

    async fn pause(&self) -> ServiceResult<()> {
        self.set_state(PlayerState::Paused);
        Ok(())
    }

    async fn next(&self) -> ServiceResult<()> {
        let mut model = self.model();
        let Some(current) = model.current else {
            return Err(HandlerError::failed("Queue is empty"));
        };

        if current + 1 < model.tracks.len() {
            model.current = Some(current + 1);
            model.state = PlayerState::Playing;
        } else {
            model.state = PlayerState::Ended;
        }
        self.publish_playback(&model);
        Ok(())
    }

    async fn previous(&self) -> ServiceResult<()> {
        let mut model = self.model();
        let Some(current) = model.current else {
            return Err(HandlerError::failed("Queue is empty"));
        };

        // On the first track this restarts it
        model.current = Some(current.saturating_sub(1));
        model.state = PlayerState::Playing;
        self.publish_playback(&model);
        Ok(())
    }

    async fn play_queue_index(&self, index: u32) -> ServiceResult<()> {
        self.jump(index as usize)
    }

    async fn set_volume(&self, volume: u32) -> ServiceResult<u32> {
        let volume = volume.min(MAX_VOLUME);
        let mut model = self.model();
        model.volume = volume;
        self.inner.volume.publish(volume);
        Ok(volume)
    }

    async fn volume(&self) -> ServiceResult<u32> {
        Ok(self.model().volume)
    }

    async fn now_playing(&self) -> ServiceResult<NowPlayingMsg> {
        Ok(self.model().now_playing())
    }

    async fn player_state(&self) -> ServiceResult<PlayerState> {
        Ok(self.model().state)
    }

    async fn queue_state(&self) -> ServiceResult<QueueStateMsg> {
        Ok(self.model().queue_state())
    }

    fn watch_player_state(&self) -> ServiceStream<PlayerState> {
        follow(&self.inner.state)
    }

    fn watch_volume(&self) -> ServiceStream<u32> {
        follow(&self.inner.volume)
    }

    fn watch_now_playing(&self) -> ServiceStream<NowPlayingMsg> {
        follow(&self.inner.now_playing)
    }

    fn watch_queue_state(&self) -> ServiceStream<QueueStateMsg> {
        follow(&self.inner.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let player = SimulatedPlayer::demo();
        assert_eq!(player.player_state().await.unwrap(), PlayerState::Unstarted);
        assert_eq!(player.volume().await.unwrap(), DEFAULT_VOLUME);
        assert_eq!(player.now_playing().await.unwrap().title, "Midnight City");

        let queue = player.queue_state().await.unwrap();
        assert_eq!(queue.current_index, Some(0));
        assert_eq!(queue.items.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let player = SimulatedPlayer::new(Vec::new());
        assert!(player.play().await.is_err());
        assert!(player.next().await.is_err());
        assert_eq!(player.now_playing().await.unwrap(), NowPlayingMsg::default());
        assert_eq!(player.queue_state().await.unwrap().current_index, None);
    }

    #[tokio::test]
    async fn test_next_past_end_ends_playback() {
        let player = SimulatedPlayer::new(vec![Track::new("Only", "One")]);
        player.play().await.unwrap();
        player.next().await.unwrap();
        assert_eq!(player.player_state().await.unwrap(), PlayerState::Ended);
        assert_eq!(player.queue_state().await.unwrap().current_index, Some(0));

        player.previous().await.unwrap();
        assert_eq!(player.player_state().await.unwrap(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn test_now_playing_reemitted_on_state_change() {
        let player = SimulatedPlayer::demo();
        let mut tracks = player.watch_now_playing();
        let first = tracks.next().await.unwrap().unwrap();

        player.pause().await.unwrap();
        assert_eq!(tracks.next().await.unwrap().unwrap(), first);

        player.next().await.unwrap();
        assert_eq!(tracks.next().await.unwrap().unwrap().title, "Digital Love");
    }

    #[tokio::test]
    async fn test_state_codes() {
        let player = SimulatedPlayer::demo();
        let mut states = player.watch_player_state();
        assert_eq!(states.next().await.unwrap().unwrap(), PlayerState::Unstarted);

        assert!(player.report_state_code(3));
        assert!(!player.report_state_code(4));
        assert!(player.report_state_code(1));

        assert_eq!(states.next().await.unwrap().unwrap(), PlayerState::Buffering);
        assert_eq!(states.next().await.unwrap().unwrap(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn test_volume_is_clamped() {
        let player = SimulatedPlayer::demo();
        assert_eq!(player.set_volume(150).await.unwrap(), MAX_VOLUME);
        assert_eq!(player.set_volume(0).await.unwrap(), 0);
        assert_eq!(player.inner.volume.get(), Some(0));
    }
}
