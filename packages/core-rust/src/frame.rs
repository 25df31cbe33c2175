//! NDB message framing.
//!
//! A message is a run of 32-bit words in the sender's byte order: three
//! header words, an optional message-id word when negotiated on the link,
//! the main payload, a segment-length table, the segment payloads, and an
//! optional trailing XOR checksum word. Bit 0 of the first word doubles
//! as a byte-order marker; receivers normalise on ingress.

use crate::error::{IcError, IcResult};

/// Fixed header words before the optional message id.
pub const MESSAGE_HEADER_WORDS: usize = 3;

/// Upper bound on the main-part size field (payload plus segment count).
pub const MAX_MAIN_MESSAGE_WORDS: usize = 25;

/// At most three segments per message.
pub const MAX_SEGMENTS: usize = 3;

/// The total-size field is 16 bits wide.
pub const MAX_MESSAGE_WORDS: usize = 0xFFFF;

/// Highest module id addressable in a header word.
pub const MAX_MODULE_ID: u32 = 0xFFFF;

/// Registration request sent as the heartbeat payload.
pub const API_REGREQ: u32 = 3;
/// Registration confirm, the peer's liveness answer.
pub const API_REGCONF: u32 = 1;
/// Registration refusal.
pub const API_REGREF: u32 = 2;

/// Module id of the cluster-membership handler on a data server.
pub const QMGR_MODULE: u32 = 252;

/// Normal send priority.
pub const NORMAL_PRIO: u32 = 1;
/// Highest send priority.
pub const MAX_PRIO_LEVEL: u32 = 3;

/// Local byte-order marker: set on big-endian hosts.
#[must_use]
pub fn local_byte_order() -> u32 {
    u32::from(cfg!(target_endian = "big"))
}

/// Packs a message reference for an iClaustron module.
#[must_use]
pub fn ic_reference(module_id: u32, node_id: u32) -> u32 {
    (module_id << 16) | node_id
}

/// Packs a reference for a classic multi-threaded peer, where the thread
/// id sits nine bits up inside the module part.
#[must_use]
pub fn classic_reference(module_id: u32, thread_id: u32, node_id: u32) -> u32 {
    ((module_id | (thread_id << 9)) << 16) | node_id
}

/// Module part of a reference.
#[must_use]
pub fn reference_module(reference: u32) -> u32 {
    reference >> 16
}

/// Node part of a reference.
#[must_use]
pub fn reference_node(reference: u32) -> u32 {
    reference & 0xFFFF
}

/// Everything needed to frame a message, minus the payloads.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub message_number: u32,
    pub priority: u32,
    pub trace_number: u32,
    pub sender_module: u32,
    pub receiver_module: u32,
    pub use_message_id: bool,
    pub use_checksum: bool,
}

impl MessageHeader {
    /// A normal-priority header with neither optional word.
    #[must_use]
    pub fn new(message_number: u32, sender_module: u32, receiver_module: u32) -> MessageHeader {
        MessageHeader {
            message_number,
            priority: NORMAL_PRIO,
            trace_number: 0,
            sender_module,
            receiver_module,
            use_message_id: false,
            use_checksum: false,
        }
    }
}

/// Frames a message into words in the local byte order.
///
/// The message-id word, when present, starts at zero; the send path
/// stamps the real id under the send-node lock via [`stamp_message_id`].
pub fn frame_message(
    header: &MessageHeader,
    main: &[u32],
    segments: &[&[u32]],
) -> IcResult<Vec<u32>> {
    if segments.len() > MAX_SEGMENTS
        || header.priority > MAX_PRIO_LEVEL
        || header.sender_module > MAX_MODULE_ID
        || header.receiver_module > MAX_MODULE_ID
    {
        return Err(IcError::InconsistentData {
            detail: "message header field out of range",
        });
    }
    let num_segments = segments.len();
    let main_size_field = main.len() + num_segments;
    if main_size_field > MAX_MAIN_MESSAGE_WORDS {
        return Err(IcError::InconsistentData {
            detail: "main message too large",
        });
    }

    let header_words = MESSAGE_HEADER_WORDS + usize::from(header.use_message_id);
    let segment_words: usize = segments.iter().map(|s| s.len() + 1).sum();
    let total =
        header_words + main.len() + segment_words + usize::from(header.use_checksum);
    if total > MAX_MESSAGE_WORDS {
        return Err(IcError::InconsistentData {
            detail: "message exceeds size field",
        });
    }

    let mut words = Vec::with_capacity(total);

    // Word 0: byte order (bits 0,7,24,31), fragmentation (1,25; unused),
    // message-id flag (2), checksum flag (4), priority (5-6),
    // total size (8-23), main-part size (26-30).
    let mut word0 = 0u32;
    if local_byte_order() == 1 {
        word0 = 0x8100_0081;
    }
    word0 |= u32::from(header.use_message_id) << 2;
    word0 |= u32::from(header.use_checksum) << 4;
    word0 |= header.priority << 5;
    word0 |= (total as u32) << 8;
    word0 |= (main_size_field as u32) << 26;
    words.push(word0);

    // Word 1: message number (0-19), trace (20-25), segment count (26-27).
    let word1 = (header.message_number & 0xF_FFFF)
        | ((header.trace_number & 0x3F) << 20)
        | ((num_segments as u32) << 26);
    words.push(word1);

    // Word 2: sender module (0-15), receiver module (16-31).
    words.push(header.sender_module | (header.receiver_module << 16));

    if header.use_message_id {
        words.push(0);
    }
    words.extend_from_slice(main);
    for segment in segments {
        words.push(segment.len() as u32);
    }
    for segment in segments {
        words.extend_from_slice(segment);
    }
    if header.use_checksum {
        let checksum = words.iter().fold(0u32, |acc, w| acc ^ w);
        words.push(checksum);
    }
    debug_assert_eq!(words.len(), total);
    Ok(words)
}

/// Total size in words from a raw first header word, normalising the
/// byte order if the sender's marker disagrees with ours.
#[must_use]
pub fn message_size_words(raw_word0: u32) -> usize {
    let word0 = if (raw_word0 & 1) == local_byte_order() {
        raw_word0
    } else {
        raw_word0.swap_bytes()
    };
    ((word0 >> 8) & 0xFFFF) as usize
}

/// Early read of the receive path: total size and receiver module id,
/// without touching the rest of the message.
pub fn read_message_early(words: &[u32]) -> IcResult<(usize, u32)> {
    if words.len() < MESSAGE_HEADER_WORDS {
        return Err(IcError::protocol(line!()));
    }
    let swap = (words[0] & 1) != local_byte_order();
    let word0 = if swap { words[0].swap_bytes() } else { words[0] };
    let word2 = if swap { words[2].swap_bytes() } else { words[2] };
    let total = ((word0 >> 8) & 0xFFFF) as usize;
    if total < MESSAGE_HEADER_WORDS {
        return Err(IcError::protocol(line!()));
    }
    Ok((total, word2 >> 16))
}

/// A fully parsed message. Payload ranges index into the normalised
/// word slice the message was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub message_number: u32,
    pub priority: u32,
    pub trace_number: u32,
    pub fragmentation: u32,
    pub message_id: Option<u32>,
    pub sender_module: u32,
    pub receiver_module: u32,
    pub total_words: usize,
    /// Main payload as a word range.
    pub main: std::ops::Range<usize>,
    /// Segment payloads as word ranges.
    pub segments: Vec<std::ops::Range<usize>>,
}

/// Parses one message in place, normalising byte order first and
/// verifying the trailing checksum when present.
pub fn parse_message(words: &mut [u32]) -> IcResult<ParsedMessage> {
    if words.len() < MESSAGE_HEADER_WORDS {
        return Err(IcError::protocol(line!()));
    }
    if (words[0] & 1) != local_byte_order() {
        let total = message_size_words(words[0]);
        if total > words.len() {
            return Err(IcError::protocol(line!()));
        }
        for word in &mut words[..total] {
            *word = word.swap_bytes();
        }
    }
    let word0 = words[0];
    let word1 = words[1];
    let word2 = words[2];

    let total = ((word0 >> 8) & 0xFFFF) as usize;
    if total < MESSAGE_HEADER_WORDS || total > words.len() {
        return Err(IcError::protocol(line!()));
    }

    let use_message_id = word0 & (1 << 2) != 0;
    let use_checksum = word0 & (1 << 4) != 0;
    if use_checksum {
        let checksum = words[..total].iter().fold(0u32, |acc, w| acc ^ w);
        if checksum != 0 {
            return Err(IcError::MessageChecksum);
        }
    }

    let main_size_field = ((word0 >> 26) & 0x1F) as usize;
    let num_segments = ((word1 >> 26) & 3) as usize;
    if main_size_field > MAX_MAIN_MESSAGE_WORDS || num_segments > MAX_SEGMENTS {
        return Err(IcError::protocol(line!()));
    }
    let main_len = main_size_field
        .checked_sub(num_segments)
        .ok_or_else(|| IcError::protocol(line!()))?;

    let mut pos = MESSAGE_HEADER_WORDS;
    let message_id = if use_message_id {
        let id = *words.get(pos).ok_or_else(|| IcError::protocol(line!()))?;
        pos += 1;
        Some(id)
    } else {
        None
    };

    let main = pos..pos + main_len;
    pos += main_len;

    let mut segments = Vec::with_capacity(num_segments);
    let table = pos..pos + num_segments;
    pos += num_segments;
    for index in table {
        let len = *words.get(index).ok_or_else(|| IcError::protocol(line!()))? as usize;
        segments.push(pos..pos + len);
        pos += len;
    }
    if pos + usize::from(use_checksum) != total {
        return Err(IcError::protocol(line!()));
    }

    Ok(ParsedMessage {
        message_number: word1 & 0xF_FFFF,
        priority: (word0 >> 5) & 3,
        trace_number: (word1 >> 20) & 0x3F,
        fragmentation: ((word0 >> 1) & 1) | (((word0 >> 25) & 1) << 1),
        message_id,
        sender_module: word2 & 0xFFFF,
        receiver_module: word2 >> 16,
        total_words: total,
        main,
        segments,
    })
}

/// Stamps a message id into word 3 of an already framed message,
/// adjusting the trailing checksum when the link negotiated one.
pub fn stamp_message_id(words: &mut [u32], message_id: u32) -> IcResult<()> {
    if words.len() <= MESSAGE_HEADER_WORDS {
        return Err(IcError::protocol(line!()));
    }
    let word0 = words[0];
    if word0 & (1 << 2) == 0 {
        return Err(IcError::InconsistentData {
            detail: "message id not negotiated for this message",
        });
    }
    let old = words[MESSAGE_HEADER_WORDS];
    words[MESSAGE_HEADER_WORDS] = message_id;
    if word0 & (1 << 4) != 0 {
        let total = ((word0 >> 8) & 0xFFFF) as usize;
        let checksum_slot = total - 1;
        if checksum_slot >= words.len() {
            return Err(IcError::protocol(line!()));
        }
        words[checksum_slot] ^= old ^ message_id;
    }
    Ok(())
}
