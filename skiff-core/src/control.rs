//! Control channel: one persistent connection carrying every control action
//! for the life of a session. Outbound actions are strictly serialized by a
//! single writer worker; inbound frames are handled by a read loop that
//! answers listing requests through the host's directory provider.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::frame::{read_length_prefixed, write_length_prefixed, BufferPool, FrameError};
use crate::model::{DirectoryListing, FileMeta};

/// Largest control frame accepted from the peer.
pub const MAX_CONTROL_FRAME: u32 = 16 * 1024 * 1024;

const TAG_LIST_DIRECTORY: u8 = 0x01;
const TAG_DIRECTORY_LISTING: u8 = 0x02;
const TAG_PROPOSE_FILES: u8 = 0x03;
const TAG_TEXT_MESSAGE: u8 = 0x04;

/// One outbound control action. Consumed exactly once, never retried.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlAction {
    /// Ask the peer for the children of `path`.
    ListDirectory { path: String },
    /// Answer a listing request.
    DirectoryListing { listing: DirectoryListing },
    /// Offer a set of files for transfer; bytes move via the transfer
    /// engine, not this channel.
    ProposeFiles { files: Vec<FileMeta> },
    TextMessage { body: String },
}

impl ControlAction {
    fn tag(&self) -> u8 {
        match self {
            ControlAction::ListDirectory { .. } => TAG_LIST_DIRECTORY,
            ControlAction::DirectoryListing { .. } => TAG_DIRECTORY_LISTING,
            ControlAction::ProposeFiles { .. } => TAG_PROPOSE_FILES,
            ControlAction::TextMessage { .. } => TAG_TEXT_MESSAGE,
        }
    }

    /// Write the action completely: tag byte, then one length-prefixed field.
    async fn write_to<W>(&self, writer: &mut W, pool: &BufferPool) -> Result<(), ControlError>
    where
        W: AsyncWrite + Unpin,
    {
        writer
            .write_all(&[self.tag()])
            .await
            .map_err(FrameError::Io)?;
        let field = match self {
            ControlAction::ListDirectory { path } => path.clone().into_bytes(),
            ControlAction::DirectoryListing { listing } => serde_json::to_vec(listing)?,
            ControlAction::ProposeFiles { files } => serde_json::to_vec(files)?,
            ControlAction::TextMessage { body } => body.clone().into_bytes(),
        };
        write_length_prefixed(writer, &field, pool).await?;
        Ok(())
    }
}

/// Inbound control traffic surfaced to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Listing(DirectoryListing),
    FilesProposed(Vec<FileMeta>),
    Message(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The connection failed; the current action and everything queued
    /// behind it fail with this, and the channel is not reopened.
    #[error("control channel broken: {0}")]
    Broken(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("malformed control payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Host-owned filesystem enumeration, invoked by the read loop to answer
/// listing requests.
pub trait DirectoryProvider: Send + Sync + 'static {
    fn list(
        &self,
        path: &str,
    ) -> impl Future<Output = std::io::Result<DirectoryListing>> + Send;
}

struct Submission {
    action: ControlAction,
    done: oneshot::Sender<Result<(), ControlError>>,
}

/// Handle over one open control connection. Dropping it stops both the
/// writer worker and the read loop.
pub struct ControlChannel {
    queue: mpsc::Sender<Submission>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl ControlChannel {
    /// Split the session socket and start the single-flight writer worker
    /// and the read loop. Returns the channel plus the inbound event stream.
    pub fn open<S, P>(stream: S, provider: P) -> (Self, mpsc::Receiver<ControlEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        P: DirectoryProvider,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (queue_tx, queue_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let pool = BufferPool::new();
        let writer_task = tokio::spawn(write_loop(write_half, queue_rx, pool.clone()));
        let reader_task = tokio::spawn(read_loop(
            read_half,
            provider,
            event_tx,
            queue_tx.clone(),
            pool,
        ));
        let channel = Self {
            queue: queue_tx,
            writer_task,
            reader_task,
        };
        (channel, event_rx)
    }

    /// Enqueue an action and await its completion. Resolves after the
    /// action's bytes are fully on the wire, in submission order relative to
    /// every other action.
    pub async fn submit(&self, action: ControlAction) -> Result<(), ControlError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.queue
            .send(Submission {
                action,
                done: done_tx,
            })
            .await
            .map_err(|_| ControlError::Broken("channel closed".to_string()))?;
        done_rx
            .await
            .map_err(|_| ControlError::Broken("channel closed".to_string()))?
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.writer_task.abort();
        self.reader_task.abort();
    }
}

/// Skip inbound events until the listing for `path` arrives. Listings for
/// any other path are stale from the caller's point of view and ignored.
pub async fn await_listing(
    events: &mut mpsc::Receiver<ControlEvent>,
    path: &str,
) -> Option<DirectoryListing> {
    while let Some(event) = events.recv().await {
        if let ControlEvent::Listing(listing) = event {
            if listing.path == path {
                return Some(listing);
            }
            tracing::debug!(event = "control_listing_ignored", path = %listing.path);
        }
    }
    None
}

async fn write_loop<W>(mut writer: W, mut queue: mpsc::Receiver<Submission>, pool: BufferPool)
where
    W: AsyncWrite + Unpin,
{
    while let Some(submission) = queue.recv().await {
        match submission.action.write_to(&mut writer, &pool).await {
            Ok(()) => {
                let _ = submission.done.send(Ok(()));
            }
            Err(error) => {
                let reason = error.to_string();
                tracing::warn!(event = "control_channel_broken", error = %reason);
                let _ = submission
                    .done
                    .send(Err(ControlError::Broken(reason.clone())));
                // Fail everything still queued, then stop taking work.
                queue.close();
                while let Some(pending) = queue.recv().await {
                    let _ = pending
                        .done
                        .send(Err(ControlError::Broken(reason.clone())));
                }
                return;
            }
        }
    }
}

async fn read_loop<R, P>(
    mut reader: R,
    provider: P,
    events: mpsc::Sender<ControlEvent>,
    queue: mpsc::Sender<Submission>,
    pool: BufferPool,
) where
    R: AsyncRead + Unpin,
    P: DirectoryProvider,
{
    loop {
        let mut tag = [0u8; 1];
        if reader.read_exact(&mut tag).await.is_err() {
            // Peer closed; the writer worker notices on its next write.
            return;
        }
        let field = match read_length_prefixed(&mut reader, MAX_CONTROL_FRAME, &pool).await {
            Ok(field) => field,
            Err(error) => {
                tracing::warn!(event = "control_read_failed", error = %error);
                return;
            }
        };
        match tag[0] {
            TAG_LIST_DIRECTORY => {
                let path = String::from_utf8_lossy(&field).into_owned();
                let listing = match provider.list(&path).await {
                    Ok(listing) => listing,
                    Err(error) => {
                        tracing::warn!(
                            event = "control_enumeration_failed",
                            path = %path,
                            error = %error
                        );
                        DirectoryListing::empty(path)
                    }
                };
                // Responses share the ordered outbound queue with local
                // submissions; completion is not tracked here.
                let (done_tx, _done_rx) = oneshot::channel();
                let response = Submission {
                    action: ControlAction::DirectoryListing { listing },
                    done: done_tx,
                };
                if queue.send(response).await.is_err() {
                    return;
                }
            }
            TAG_DIRECTORY_LISTING => match serde_json::from_slice(&field) {
                Ok(listing) => {
                    if events.send(ControlEvent::Listing(listing)).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    tracing::warn!(event = "control_bad_listing", error = %error);
                }
            },
            TAG_PROPOSE_FILES => match serde_json::from_slice(&field) {
                Ok(files) => {
                    if events
                        .send(ControlEvent::FilesProposed(files))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(error) => {
                    tracing::warn!(event = "control_bad_file_list", error = %error);
                }
            },
            TAG_TEXT_MESSAGE => {
                let body = String::from_utf8_lossy(&field).into_owned();
                if events.send(ControlEvent::Message(body)).await.is_err() {
                    return;
                }
            }
            other => {
                tracing::warn!(event = "control_unknown_action", tag = other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DirectoryListing, FolderMeta};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Provider for ends that are not expected to answer listing requests.
    struct NoDirs;

    impl DirectoryProvider for NoDirs {
        async fn list(&self, path: &str) -> std::io::Result<DirectoryListing> {
            Ok(DirectoryListing::empty(path))
        }
    }

    /// Provider answering every request with one folder under the asked path.
    struct OneFolder;

    impl DirectoryProvider for OneFolder {
        async fn list(&self, path: &str) -> std::io::Result<DirectoryListing> {
            Ok(DirectoryListing {
                path: path.to_string(),
                children_folders: vec![FolderMeta {
                    name: "albums".to_string(),
                    path: format!("{path}/albums"),
                    child_count: 2,
                    last_modified_epoch_millis: 1_600_000_000_000,
                }],
                children_files: Vec::new(),
            })
        }
    }

    async fn read_raw_action<R: AsyncRead + Unpin>(reader: &mut R) -> (u8, Vec<u8>) {
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag).await.unwrap();
        let field = read_length_prefixed(reader, MAX_CONTROL_FRAME, &BufferPool::new())
            .await
            .unwrap();
        (tag[0], field)
    }

    #[tokio::test]
    async fn actions_are_serialized_in_submission_order() {
        let (local, mut remote) = tokio::io::duplex(256 * 1024);
        let (channel, _events) = ControlChannel::open(local, NoDirs);

        // A large payload followed by small ones; every byte of A must
        // precede every byte of B on the wire.
        let big = "a".repeat(100 * 1024);
        let actions = vec![
            ControlAction::TextMessage { body: big.clone() },
            ControlAction::ListDirectory {
                path: "/music".to_string(),
            },
            ControlAction::TextMessage {
                body: "tail".to_string(),
            },
        ];
        let submit = {
            let actions = actions.clone();
            async move {
                for action in actions {
                    channel.submit(action).await.unwrap();
                }
                channel
            }
        };
        let read = async {
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(read_raw_action(&mut remote).await);
            }
            seen
        };
        let (channel, seen) = tokio::join!(submit, read);
        assert_eq!(seen[0].0, TAG_TEXT_MESSAGE);
        assert_eq!(seen[0].1, big.as_bytes());
        assert_eq!(seen[1].0, TAG_LIST_DIRECTORY);
        assert_eq!(seen[1].1, b"/music");
        assert_eq!(seen[2].0, TAG_TEXT_MESSAGE);
        assert_eq!(seen[2].1, b"tail");
        drop(channel);
    }

    #[tokio::test]
    async fn broken_channel_fails_current_and_later_submissions() {
        let (local, remote) = tokio::io::duplex(1024);
        let (channel, _events) = ControlChannel::open(local, NoDirs);
        drop(remote);

        // More bytes than the pipe can buffer so the write hits the closed
        // peer.
        let result = channel
            .submit(ControlAction::TextMessage {
                body: "x".repeat(64 * 1024),
            })
            .await;
        assert!(matches!(result, Err(ControlError::Broken(_))));

        let later = channel
            .submit(ControlAction::TextMessage {
                body: "anything".to_string(),
            })
            .await;
        assert!(matches!(later, Err(ControlError::Broken(_))));
    }

    #[tokio::test]
    async fn listing_request_is_answered_by_provider() {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (requester, mut requester_events) = ControlChannel::open(left, NoDirs);
        let (responder, _responder_events) = ControlChannel::open(right, OneFolder);

        requester
            .submit(ControlAction::ListDirectory {
                path: "/music".to_string(),
            })
            .await
            .unwrap();

        let listing = timeout(
            Duration::from_secs(2),
            await_listing(&mut requester_events, "/music"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(listing.path, "/music");
        assert_eq!(listing.children_folders[0].path, "/music/albums");
        drop((requester, responder));
    }

    #[tokio::test]
    async fn stale_listing_is_ignored() {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (requester, mut requester_events) = ControlChannel::open(left, NoDirs);
        let (responder, _responder_events) = ControlChannel::open(right, OneFolder);

        // A listing for a path the requester no longer cares about arrives
        // first; the answer to the live request must still be delivered.
        responder
            .submit(ControlAction::DirectoryListing {
                listing: DirectoryListing::empty("/old/path"),
            })
            .await
            .unwrap();
        requester
            .submit(ControlAction::ListDirectory {
                path: "/music".to_string(),
            })
            .await
            .unwrap();

        let listing = timeout(
            Duration::from_secs(2),
            await_listing(&mut requester_events, "/music"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(listing.path, "/music");
        drop((requester, responder));
    }

    #[tokio::test]
    async fn messages_and_proposals_reach_the_peer() {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (sender, _sender_events) = ControlChannel::open(left, NoDirs);
        let (receiver, mut receiver_events) = ControlChannel::open(right, NoDirs);

        let files = vec![crate::model::FileMeta {
            name: "a.mp3".to_string(),
            path: "/music/a.mp3".to_string(),
            size: 123,
            last_modified_epoch_millis: 1_600_000_000_000,
        }];
        sender
            .submit(ControlAction::TextMessage {
                body: "hello".to_string(),
            })
            .await
            .unwrap();
        sender
            .submit(ControlAction::ProposeFiles {
                files: files.clone(),
            })
            .await
            .unwrap();

        let first = timeout(Duration::from_secs(2), receiver_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, ControlEvent::Message("hello".to_string()));
        let second = timeout(Duration::from_secs(2), receiver_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, ControlEvent::FilesProposed(files));
        drop((sender, receiver));
    }
}
