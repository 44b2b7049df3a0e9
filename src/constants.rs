// Frame format shared with the voice transport. These must stay bit-exact.
pub const FRAME_LENGTH_MS: u32 = 20;
pub const CHANNELS: usize = 2;
pub const SAMPLE_SIZE: usize = 2; // 16-bit signed little-endian

pub const INPUT_SAMPLE_RATE: u32 = 44100; // decode backend output
pub const OUTPUT_SAMPLE_RATE: u32 = 48000; // voice transport input

/// Sample frames (one sample per channel) in one 20ms frame at `rate`.
pub const fn frames_per_packet(rate: u32) -> usize {
    (rate * FRAME_LENGTH_MS / 1000) as usize
}

pub const INPUT_FRAME_SAMPLES: usize = frames_per_packet(INPUT_SAMPLE_RATE);
pub const OUTPUT_FRAME_SAMPLES: usize = frames_per_packet(OUTPUT_SAMPLE_RATE);

/// Bytes in one 20ms frame of decoder output (3528).
pub const INPUT_FRAME_BYTES: usize = INPUT_FRAME_SAMPLES * CHANNELS * SAMPLE_SIZE;

/// Bytes in one 20ms frame handed to the transport (3840).
pub const OUTPUT_FRAME_BYTES: usize = OUTPUT_FRAME_SAMPLES * CHANNELS * SAMPLE_SIZE;

/// One second of decoder output, the default pipe capacity.
pub const PIPE_CAPACITY: usize = INPUT_FRAME_BYTES * 50;
