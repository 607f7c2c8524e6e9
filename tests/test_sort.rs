// tests/test_sort.rs — Sorting encoded keypoints on the reference device.

use rudolf_flow::keypoint::codec::{decode_keypoints, encode_keypoints, encoder_length, NULL_PIXEL};
use rudolf_flow::keypoint::sorter::{EncodedKeypoints, KeypointSorter, SORTER_TEXTURES};
use rudolf_flow::{GpuConfig, GpuContext, Keypoint, TextureHandle};

struct Fixture {
    gpu: GpuContext,
    sorter: KeypointSorter,
    input: TextureHandle,
    scratch: [TextureHandle; SORTER_TEXTURES],
}

impl Fixture {
    fn new() -> Self {
        let mut gpu = GpuContext::new(GpuConfig::default());
        let input = gpu.allocate().unwrap();
        let scratch = [
            gpu.allocate().unwrap(),
            gpu.allocate().unwrap(),
            gpu.allocate().unwrap(),
            gpu.allocate().unwrap(),
        ];
        let sorter = KeypointSorter::new(&gpu).unwrap();
        Fixture { gpu, sorter, input, scratch }
    }

    fn sort(&mut self, pixels: &[u8], length: u32, max_keypoints: usize, output_length: u32) -> Vec<u8> {
        self.sort_records(pixels, (0, 0), length, max_keypoints, output_length)
    }

    /// Sort records carrying `(descriptor_size, extra_size)` payload bytes.
    fn sort_records(
        &mut self,
        pixels: &[u8],
        (descriptor_size, extra_size): (usize, usize),
        length: u32,
        max_keypoints: usize,
        output_length: u32,
    ) -> Vec<u8> {
        self.gpu.upload_bytes(self.input, length, length, pixels).unwrap();
        let layout = EncodedKeypoints {
            texture: self.input,
            descriptor_size,
            extra_size,
            encoder_length: length,
        };
        let out = self
            .sorter
            .sort(&mut self.gpu, &self.scratch, layout, max_keypoints, output_length)
            .unwrap();
        assert_eq!(self.gpu.size(out).unwrap(), (output_length, output_length));
        self.gpu.read_pixels(out).unwrap().into_bytes()
    }
}

fn scores(pixels: &[u8], length: u32) -> Vec<f32> {
    decode_keypoints(pixels, 0, 0, length).iter().map(|k| k.score).collect()
}

/// Scores 3, 1, 4, 1, 5 followed by two discarded records.
fn sample() -> (Vec<u8>, u32) {
    let length = 4;
    let keypoints: Vec<Keypoint> = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 9.0]
        .iter()
        .enumerate()
        .map(|(i, &s)| Keypoint::new(i as f32, 0.0, s))
        .collect();
    let mut pixels = encode_keypoints(&keypoints, 0, 0, length);
    pixels[5 * 8..7 * 8].fill(0);
    (pixels, length)
}

#[test]
fn sorts_by_descending_score_and_drops_discarded() {
    let (pixels, length) = sample();
    let mut f = Fixture::new();
    let sorted = f.sort(&pixels, length, 8, length);

    assert_eq!(scores(&sorted, length), vec![5.0, 4.0, 3.0, 1.0, 1.0]);
    // null from the sixth record on
    assert!(sorted[5 * 8..].chunks_exact(4).all(|p| p == NULL_PIXEL));
}

#[test]
fn records_move_with_their_descriptor_and_extra_bytes() {
    let (d, e) = (8, 4);
    let keypoints: Vec<Keypoint> = [3.0, 1.0, 4.0, 1.5, 5.0]
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            let i = i as u8;
            Keypoint::new(i as f32, 1.0, s)
                .with_descriptor(vec![i; d])
                .with_extra(vec![100 + i; e])
        })
        .collect();
    let length = encoder_length(keypoints.len(), d, e);
    let pixels = encode_keypoints(&keypoints, d, e, length);

    let mut f = Fixture::new();
    let sorted = f.sort_records(&pixels, (d, e), length, keypoints.len(), length);
    let decoded = decode_keypoints(&sorted, d, e, length);

    let summary: Vec<(f32, f32, u8, u8)> =
        decoded.iter().map(|k| (k.score, k.x, k.descriptor[0], k.extra[0])).collect();
    assert_eq!(
        summary,
        vec![
            (5.0, 4.0, 4, 104),
            (4.0, 2.0, 2, 102),
            (3.0, 0.0, 0, 100),
            (1.5, 3.0, 3, 103),
            (1.0, 1.0, 1, 101),
        ]
    );
    // whole payloads, not just their first bytes
    for k in &decoded {
        let i = k.x as u8;
        assert_eq!(k.descriptor, vec![i; d]);
        assert_eq!(k.extra, vec![100 + i; e]);
    }
}

#[test]
fn equal_scores_keep_their_relative_order() {
    let (pixels, length) = sample();
    let mut f = Fixture::new();
    let sorted = f.sort(&pixels, length, 8, length);
    let xs: Vec<f32> = decode_keypoints(&sorted, 0, 0, length).iter().map(|k| k.x).collect();
    assert_eq!(xs, vec![4.0, 2.0, 0.0, 1.0, 3.0]);
}

#[test]
fn sorting_twice_changes_nothing() {
    let (pixels, length) = sample();
    let mut f = Fixture::new();
    let once = f.sort(&pixels, length, 8, length);
    let twice = f.sort(&once, length, 8, length);
    assert_eq!(once, twice);
}

#[test]
fn top_k_into_a_smaller_encoding() {
    let (pixels, length) = sample();
    let mut f = Fixture::new();
    let out_length = encoder_length(2, 0, 0);
    let top = f.sort(&pixels, length, 2, out_length);
    assert_eq!(scores(&top, out_length), vec![5.0, 4.0]);
}

#[test]
fn larger_lists_sort_across_many_merge_passes() {
    let length = encoder_length(300, 0, 0);
    let keypoints: Vec<Keypoint> = (0..300)
        .map(|i| Keypoint::new(i as f32, 0.0, ((i * 7919) % 1000) as f32 / 10.0))
        .collect();
    let pixels = encode_keypoints(&keypoints, 0, 0, length);

    let mut f = Fixture::new();
    let sorted = scores(&f.sort(&pixels, length, 300, length), length);
    assert_eq!(sorted.len(), 300);
    assert!(sorted.windows(2).all(|w| w[0] >= w[1]));
}
