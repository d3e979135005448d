use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::comm::communicator::{Communicator, SendOptions};
use crate::comm::handler::MessageHandler;
use crate::config::RawChannelConfig;
use crate::messaging::message::{Message, StructuredPayload};
use crate::messaging::system_types::SystemMessageType;
use crate::raw::block::{Block, BlockFlags};
use crate::raw::block_receiver::{BlockReceiver, ReceiveOutcome};
use crate::raw::block_sender::{BlockSender, ResendOutcome, ResendRequest};
use crate::raw::byte_buffer::ByteRingBuffer;
use crate::raw::channel_error::ChannelError;
use crate::raw::raw_handlers::{RawDataHandler, RawDataResendHandler};

pub(crate) const KEY_CHANNEL: &str = "channel";
const KEY_COMPRESS: &str = "compress";
const KEY_BLOCK: &str = "block";
const KEY_CODE: &str = "code";
const KEY_NEXT_EXPECTED: &str = "next_expected";

/// State of a raw channel that is shared between the application facing [RawChannel] and the
///  handlers processing the peer's messages
pub(crate) struct ChannelShared {
    pub local_id: i64,
    config: Arc<RawChannelConfig>,
    compress_outgoing: bool,
    /// held for the entire sending of a block, including waiting for its acknowledgement
    write_lock: tokio::sync::Mutex<()>,
    sender: StdMutex<BlockSender>,
    receiver: StdMutex<BlockReceiver>,
    pub buffer: ByteRingBuffer,
    output_finished: AtomicBool,
}

impl ChannelShared {
    fn new(local_id: i64, remote_id: i64, config: Arc<RawChannelConfig>, compress_outgoing: bool) -> ChannelShared {
        ChannelShared {
            local_id,
            compress_outgoing,
            write_lock: Default::default(),
            sender: StdMutex::new(BlockSender::new(remote_id, config.retained_blocks)),
            receiver: Default::default(),
            buffer: ByteRingBuffer::new(config.buffer_capacity),
            output_finished: AtomicBool::new(false),
            config,
        }
    }

    fn lock_sender(&self) -> MutexGuard<'_, BlockSender> {
        self.sender.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn remote_id(&self) -> i64 {
        self.lock_sender().channel_id()
    }

    pub fn on_block(&self, block: Block) -> ReceiveOutcome {
        self.receiver.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_block(block)
    }

    /// Hands a block that is complete in sequence to the application
    pub async fn deliver(&self, block: Block) -> Result<(), ChannelError> {
        let data = if block.flags.contains(BlockFlags::COMPRESSED) {
            match decompress(&block.data, self.config.buffer_capacity) {
                Ok(data) => data,
                Err(e) => {
                    warn!("raw channel {}: {}", self.local_id, e);
                    self.buffer.abort("undecodable compressed block");
                    return Err(e);
                }
            }
        }
        else {
            block.data
        };

        if !data.is_empty() {
            self.buffer.write_all(&data).await?;
        }
        if block.flags.contains(BlockFlags::END_OF_STREAM) {
            debug!("raw channel {}: end of stream", self.local_id);
            self.buffer.close();
        }
        Ok(())
    }

    pub fn on_resend_request(&self, request: &ResendRequest) -> ResendOutcome {
        self.lock_sender().on_resend_request(request)
    }

    pub fn abort_block(&self) -> Block {
        self.lock_sender().abort_block()
    }
}

pub(crate) fn resend_request_message(channel_id: i64, request: &ResendRequest) -> Message {
    Message::system(SystemMessageType::RawDataResend, StructuredPayload::new()
        .with(KEY_CHANNEL, channel_id)
        .with(KEY_BLOCK, request.block_number)
        .with(KEY_CODE, request.code)
        .with(KEY_NEXT_EXPECTED, request.next_expected))
}

pub(crate) fn resend_request_from_message(message: &Message) -> anyhow::Result<ResendRequest> {
    let get = |key: &str| message.get_i64(key)
        .ok_or_else(|| anyhow!("resend request without valid '{}'", key));

    let block_number = get(KEY_BLOCK)?;
    let next_expected = get(KEY_NEXT_EXPECTED)?;
    if block_number < 0 || next_expected < 0 {
        bail!("resend request with negative block number");
    }
    Ok(ResendRequest {
        block_number: block_number as u64,
        code: get(KEY_CODE)?,
        next_expected: next_expected as u64,
    })
}

const COMPRESSION_LEVEL: i32 = 1;

fn compress(data: &[u8]) -> Result<Bytes, ChannelError> {
    Ok(Bytes::from(zstd::stream::encode_all(data, COMPRESSION_LEVEL)?))
}

fn decompress(data: &[u8], limit: usize) -> Result<Bytes, ChannelError> {
    let mut decoded = Vec::new();
    zstd::stream::read::Decoder::new(data)?
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)?;
    if decoded.len() > limit {
        return Err(ChannelError::Aborted(format!("compressed block expands to more than {} bytes", limit)));
    }
    Ok(Bytes::from(decoded))
}

fn new_channel_id() -> i64 {
    loop {
        let id = rand::random::<i64>() & i64::MAX;
        if id != 0 {
            return id;
        }
    }
}

/// A reliable, ordered byte stream between two peers, multiplexed over a [Communicator] as a
///  sequence of numbered, checksummed blocks.
///
/// One side opens the channel with [RawChannel::open] (or [Communicator::open_raw_channel]), the
///  other side receives it from [Communicator::accept_raw_channel]. Both sides can write and read.
///
/// A channel should be closed explicitly: its handlers stay registered with the communicator
///  until [RawChannel::close] is called or the connection terminates.
pub struct RawChannel {
    shared: Arc<ChannelShared>,
    communicator: Weak<Communicator>,
    data_handler: Arc<dyn MessageHandler>,
    resend_handler: Arc<dyn MessageHandler>,
    close_listener_id: u64,
    closed: AtomicBool,
}

impl RawChannel {
    pub async fn open(communicator: &Arc<Communicator>, config: Arc<RawChannelConfig>) -> anyhow::Result<RawChannel> {
        let local_id = new_channel_id();
        let compress = config.compression;
        let shared = Arc::new(ChannelShared::new(local_id, -1, config, compress));
        // ready to receive before the peer knows about the channel
        let channel = Self::register(communicator, shared).await;

        let request = Message::system(SystemMessageType::RawDataConnection, StructuredPayload::new()
            .with(KEY_CHANNEL, local_id)
            .with(KEY_COMPRESS, compress));
        let response = communicator.send(request, SendOptions::expecting(vec![SystemMessageType::Acknowledgement.code()])).await;

        let remote_id = match response {
            Ok(Some(response)) if response.is_successful() => response.get_i64(KEY_CHANNEL),
            Ok(Some(response)) => {
                channel.unregister().await;
                bail!("peer rejected raw channel: {}", response.error_message().unwrap_or("no reason given"));
            }
            Ok(None) => None,
            Err(e) => {
                channel.unregister().await;
                return Err(e);
            }
        };
        let Some(remote_id) = remote_id else {
            channel.unregister().await;
            bail!("peer did not confirm raw channel {}", local_id);
        };

        channel.shared.lock_sender().set_channel_id(remote_id);
        info!("opened raw channel {} -> {}", local_id, remote_id);
        Ok(channel)
    }

    /// Creates the accepting side of a channel the peer requested, returning it together with
    ///  the response for the peer
    pub(crate) async fn accept(communicator: &Arc<Communicator>, request: &Message, config: Arc<RawChannelConfig>) -> anyhow::Result<(RawChannel, Message)> {
        let Some(remote_id) = request.get_i64(KEY_CHANNEL) else {
            bail!("raw channel request without a channel id");
        };
        let compress = request.get_bool(KEY_COMPRESS).unwrap_or(false);

        let local_id = new_channel_id();
        let shared = Arc::new(ChannelShared::new(local_id, remote_id, config, compress));
        let channel = Self::register(communicator, shared).await;

        info!("accepted raw channel {} -> {}", local_id, remote_id);
        let response = Message::acknowledgement(request, StructuredPayload::success(true)
            .with(KEY_CHANNEL, local_id));
        Ok((channel, response))
    }

    async fn register(communicator: &Arc<Communicator>, shared: Arc<ChannelShared>) -> RawChannel {
        let data_handler: Arc<dyn MessageHandler> = Arc::new(RawDataHandler { shared: shared.clone() });
        let resend_handler: Arc<dyn MessageHandler> = Arc::new(RawDataResendHandler { shared: shared.clone() });
        communicator.register_system_handler(data_handler.clone()).await;
        communicator.register_system_handler(resend_handler.clone()).await;

        let weak_shared = Arc::downgrade(&shared);
        let close_listener_id = communicator.on_close(move |_| {
            if let Some(shared) = weak_shared.upgrade() {
                shared.buffer.abort("connection closed");
            }
        });

        RawChannel {
            shared,
            communicator: Arc::downgrade(communicator),
            data_handler,
            resend_handler,
            close_listener_id,
            closed: AtomicBool::new(false),
        }
    }

    async fn unregister(&self) {
        if let Some(communicator) = self.communicator.upgrade() {
            communicator.remove_system_handler(&self.data_handler).await;
            communicator.remove_system_handler(&self.resend_handler).await;
            communicator.remove_close_listener(self.close_listener_id);
        }
    }

    pub fn local_id(&self) -> i64 {
        self.shared.local_id
    }

    pub fn remote_id(&self) -> i64 {
        self.shared.remote_id()
    }

    pub fn is_compressed(&self) -> bool {
        self.shared.compress_outgoing
    }

    fn communicator(&self) -> Result<Arc<Communicator>, ChannelError> {
        match self.communicator.upgrade() {
            Some(c) if c.is_running() => Ok(c),
            _ => Err(ChannelError::ConnectionGone),
        }
    }

    /// Sends all of `data`, split into blocks
    pub async fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.shared.output_finished.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        for chunk in data.chunks(self.shared.config.block_size) {
            self.send_block(BlockFlags::empty(), chunk).await?;
        }
        Ok(())
    }

    async fn send_block(&self, flags: BlockFlags, data: &[u8]) -> Result<(), ChannelError> {
        let communicator = self.communicator()?;

        let (payload, mut flags) = if self.shared.compress_outgoing && !data.is_empty() {
            (compress(data)?, flags | BlockFlags::COMPRESSED)
        }
        else {
            (Bytes::copy_from_slice(data), flags)
        };
        // the end of stream is always confirmed, there are no later blocks to reveal its loss
        let acknowledged = self.shared.config.acknowledged || flags.contains(BlockFlags::END_OF_STREAM);
        if acknowledged {
            flags |= BlockFlags::ACK_REQUESTED;
        }

        let _write_guard = self.shared.write_lock.lock().await;
        let block = {
            let mut sender = self.shared.lock_sender();
            if let Some(requested) = sender.failed_block() {
                return Err(ChannelError::OutOfWindow { requested });
            }
            sender.next_block(flags, payload)
        };
        let block_number = block.number;
        let message = Message::system(SystemMessageType::RawData, block.to_bytes());

        if !acknowledged {
            communicator.queue(message).await?;
            return Ok(());
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let options = SendOptions::expecting(vec![SystemMessageType::Acknowledgement.code()])
                .with_wait(self.shared.config.ack_wait_time);
            match communicator.send(message.clone(), options).await? {
                Some(response) if response.is_successful() => {
                    trace!("block {} acknowledged", block_number);
                    return Ok(());
                }
                Some(_) => debug!("peer received block {} corrupted - re-sending", block_number),
                None if !communicator.is_running() => return Err(ChannelError::ConnectionGone),
                None => debug!("no acknowledgement for block {} - re-sending", block_number),
            }
            if let Some(max_attempts) = self.shared.config.max_ack_attempts {
                if attempts >= max_attempts {
                    return Err(ChannelError::NotAcknowledged(block_number));
                }
            }
        }
    }

    /// Reads available bytes, waiting until there are some. `Ok(0)` signals the end of the
    ///  stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        self.shared.buffer.read(buf).await
    }

    pub async fn read_to_end(&self) -> Result<Vec<u8>, ChannelError> {
        let mut result = Vec::new();
        let mut buf = vec![0u8; 64*1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(result);
            }
            result.extend_from_slice(&buf[..n]);
        }
    }

    /// Ends this side's output: the peer reads the end of the stream after all data written so
    ///  far. Reading is not affected.
    pub async fn finish(&self) -> Result<(), ChannelError> {
        if self.shared.output_finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.send_block(BlockFlags::END_OF_STREAM, &[]).await
    }

    /// Finishes output if that did not happen yet, and releases the channel. Data arriving from
    ///  the peer afterwards is discarded.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.finish().await {
            debug!("raw channel {}: could not send end of stream: {}", self.shared.local_id, e);
        }
        self.unregister().await;
        self.shared.buffer.close();
        debug!("closed raw channel {}", self.shared.local_id);
    }
}
