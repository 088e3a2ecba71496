//! Measurement Engine — content-addressed digest of a loaded image
//!
//! The digest binds the layout shape and the page contents of the image:
//! 1. the size triple (runtime − loader, app − runtime, free − app), as u64 LE
//! 2. every page of the loader, runtime and application regions, in that order
//!
//! Absolute load addresses are never hashed, so the same image loaded at a
//! different base produces the same digest.

use super::digest::{Digest, MeasurementHash};
use crate::region::{page_round_up, pages_for, Layout, RegionDescriptor, PAGE_SIZE};
use sha3::Digest as _;

/// Raw artifacts of an enclave image plus the reference peers use to find it
#[derive(Debug, Clone)]
pub struct ImageBundle {
    /// Stable reference to the application artifact (e.g. its path)
    pub reference: String,
    pub loader: Vec<u8>,
    pub runtime: Vec<u8>,
    pub app: Vec<u8>,
}

impl ImageBundle {
    pub fn new(
        reference: impl Into<String>,
        loader: Vec<u8>,
        runtime: Vec<u8>,
        app: Vec<u8>,
    ) -> Self {
        Self {
            reference: reference.into(),
            loader,
            runtime,
            app,
        }
    }

    /// Read the three artifacts from disk, using the application path as reference
    pub fn from_files(
        loader: impl AsRef<std::path::Path>,
        runtime: impl AsRef<std::path::Path>,
        app: impl AsRef<std::path::Path>,
    ) -> std::io::Result<Self> {
        let app_path = app.as_ref();
        Ok(Self {
            reference: app_path.to_string_lossy().into_owned(),
            loader: std::fs::read(loader)?,
            runtime: std::fs::read(runtime)?,
            app: std::fs::read(app_path)?,
        })
    }

    /// Pages the image occupies once every artifact is page padded
    pub fn image_pages(&self) -> usize {
        [&self.loader, &self.runtime, &self.app]
            .iter()
            .map(|blob| pages_for(blob.len()))
            .sum()
    }

    /// Digest this bundle would have once loaded
    pub fn measure(&self) -> Digest {
        measure_artifacts(&self.loader, &self.runtime, &self.app)
    }
}

/// Measure an image loaded into an exclusive region.
///
/// `memory` is the backing store of `region`; the layout must already lie
/// inside it. Ordering violations are rejected before anything is hashed.
pub fn measure_layout(
    layout: &Layout,
    region: &RegionDescriptor,
    memory: &[u8],
) -> Result<Digest, String> {
    layout.validate(region, &[])?;
    if memory.len() as u64 != region.len() {
        return Err(format!(
            "backing memory is {} bytes but region is {} bytes",
            memory.len(),
            region.len()
        ));
    }

    let offset = |addr: u64| (addr - region.base()) as usize;
    let loader = &memory[offset(layout.loader_base)..offset(layout.runtime_base)];
    let runtime = &memory[offset(layout.runtime_base)..offset(layout.app_base)];
    let app = &memory[offset(layout.app_base)..offset(layout.free_base)];

    let mut h = MeasurementHash::new();
    hash_sizes(&mut h, layout.sizes());
    for segment in [loader, runtime, app] {
        for page in segment.chunks(PAGE_SIZE) {
            h.update(page);
        }
    }
    let digest = Digest::from_hasher(h);
    log::debug!(
        "measured image: sizes={:?} digest={}",
        layout.sizes(),
        digest.short()
    );
    Ok(digest)
}

/// Measure raw artifacts as if they had been loaded contiguously, each
/// zero padded to a page boundary. Used by verifiers that only hold files.
pub fn measure_artifacts(loader: &[u8], runtime: &[u8], app: &[u8]) -> Digest {
    let segments = [loader, runtime, app];
    let sizes = segments.map(|s| page_round_up(s.len()) as u64);

    let mut h = MeasurementHash::new();
    hash_sizes(&mut h, sizes);
    for segment in segments {
        hash_padded_pages(&mut h, segment);
    }
    Digest::from_hasher(h)
}

/// Digest of the platform (monitor) image, zero padded to the size of the
/// region it is loaded into.
pub fn measure_platform(image: &[u8], region_size: usize) -> Digest {
    let mut h = MeasurementHash::new();
    let used = image.len().min(region_size);
    h.update(&image[..used]);
    let zeros = [0u8; PAGE_SIZE];
    let mut remaining = region_size - used;
    while remaining > 0 {
        let n = remaining.min(PAGE_SIZE);
        h.update(&zeros[..n]);
        remaining -= n;
    }
    Digest::from_hasher(h)
}

fn hash_sizes(h: &mut MeasurementHash, sizes: [u64; 3]) {
    for size in sizes {
        h.update(size.to_le_bytes());
    }
}

fn hash_padded_pages(h: &mut MeasurementHash, segment: &[u8]) {
    for chunk in segment.chunks(PAGE_SIZE) {
        if chunk.len() == PAGE_SIZE {
            h.update(chunk);
        } else {
            let mut page = [0u8; PAGE_SIZE];
            page[..chunk.len()].copy_from_slice(chunk);
            h.update(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Permission, RegionKind};

    fn load(bundle: &ImageBundle, base: u64, pages: usize) -> (Layout, RegionDescriptor, Vec<u8>) {
        let region = RegionDescriptor::new(
            base,
            (pages * PAGE_SIZE) as u64,
            Permission::ReadWriteExecute,
            RegionKind::Exclusive,
        )
        .unwrap();
        let mut memory = vec![0u8; pages * PAGE_SIZE];
        let mut cursor = 0usize;
        let mut bases = [0u64; 4];
        for (i, blob) in [&bundle.loader, &bundle.runtime, &bundle.app].iter().enumerate() {
            bases[i] = base + cursor as u64;
            memory[cursor..cursor + blob.len()].copy_from_slice(blob);
            cursor += page_round_up(blob.len());
        }
        bases[3] = base + cursor as u64;
        let layout = Layout {
            loader_base: bases[0],
            runtime_base: bases[1],
            app_base: bases[2],
            free_base: bases[3],
        };
        (layout, region, memory)
    }

    fn bundle() -> ImageBundle {
        ImageBundle::new(
            "app.bin",
            vec![0x11; 100],
            vec![0x22; PAGE_SIZE + 7],
            (0..3000u32).map(|i| i as u8).collect(),
        )
    }

    #[test]
    fn test_relocation_does_not_change_digest() {
        let b = bundle();
        let (l1, r1, m1) = load(&b, 0x8000_0000, 8);
        let (l2, r2, m2) = load(&b, 0x9123_4000, 8);
        let d1 = measure_layout(&l1, &r1, &m1).unwrap();
        let d2 = measure_layout(&l2, &r2, &m2).unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn test_loaded_image_matches_artifact_measurement() {
        let b = bundle();
        let (l, r, m) = load(&b, 0x8000_0000, 8);
        assert_eq!(measure_layout(&l, &r, &m).unwrap(), b.measure());
    }

    #[test]
    fn test_content_change_changes_digest() {
        let b = bundle();
        let mut other = b.clone();
        other.app[10] ^= 1;
        assert_ne!(b.measure(), other.measure());
    }

    #[test]
    fn test_layout_shape_is_bound() {
        // Same bytes overall, different split between runtime and application
        let a = measure_artifacts(&[1u8; PAGE_SIZE], &[2u8; PAGE_SIZE], &[3u8; 2 * PAGE_SIZE]);
        let mut runtime = vec![2u8; PAGE_SIZE];
        runtime.extend_from_slice(&[3u8; PAGE_SIZE]);
        let b = measure_artifacts(&[1u8; PAGE_SIZE], &runtime, &[3u8; PAGE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_bad_layout_rejected_before_hashing() {
        let b = bundle();
        let (mut l, r, m) = load(&b, 0x8000_0000, 8);
        l.app_base = l.runtime_base - PAGE_SIZE as u64;
        assert!(measure_layout(&l, &r, &m).is_err());
    }

    #[test]
    fn test_platform_digest_padding() {
        let image = vec![0xAB; 5000];
        let d1 = measure_platform(&image, 0x1ff000);
        let mut padded = image.clone();
        padded.resize(0x1ff000, 0);
        let d2 = measure_platform(&padded, 0x1ff000);
        assert_eq!(d1, d2);
        assert_ne!(d1, measure_platform(&image, 0x2000));
    }
}
