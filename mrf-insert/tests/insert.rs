use mrf_insert::{
    InsertError, InsertOptions, Inserter, PatchError, PatchProgress, PatchStage, SilentProgress,
    patch,
};
use mrf_tile::header::{Header, SourceRef};
use mrf_tile::image::{DataType, ImageDesc, PageSize, Size};
use mrf_tile::cache::BlockKey;
use mrf_tile::index::TileState;
use mrf_tile::pyramid::Pyramid;
use mrf_tile::raster::{
    GeoTransform, MemRaster, Raster, Resampling, Window, WindowRequest,
};
use rstest::rstest;
use std::cell::RefCell;
use std::path::Path;
use tempfile::TempDir;

/// 64x64 pixels of one unit each, north up, with two overview levels.
fn desc() -> ImageDesc {
    ImageDesc::new(Size::new(64, 64), PageSize::new(16, 16, 1), 1, DataType::Byte)
        .with_nodata(0.0)
        .with_full_pyramid()
}

fn geo_at(x: f64, y: f64) -> GeoTransform {
    GeoTransform::new(x, 1.0, 64.0 - y, -1.0)
}

fn target() -> Pyramid {
    Pyramid::in_memory(desc(), Some(geo_at(0.0, 0.0))).unwrap()
}

fn filled_target(value: u8) -> Pyramid {
    let mut t = target();
    let req = WindowRequest::new(Window::new(0, 0, 64, 64), 0..1, 1);

    t.write_window(&req, &[value; 64 * 64]).unwrap();
    t.flush().unwrap();
    t
}

fn source(x: usize, y: usize, w: usize, h: usize, value: u8) -> MemRaster {
    let mut s = MemRaster::new(Size::new(w, h), 1, DataType::Byte)
        .with_geo_transform(geo_at(x as f64, y as f64));
    s.fill_with(|_, _, _| f64::from(value));
    s
}

fn pixel(p: &mut Pyramid, level: usize, x: usize, y: usize) -> u8 {
    let mut buf = [0u8; 1];
    let req = WindowRequest::new(Window::new(x, y, 1, 1), 0..1, 1);

    p.read_level_window(level, &req, &mut buf).unwrap();
    buf[0]
}

#[test]
fn patch_and_propagate() {
    let mut t = target();
    let mut s = source(16, 16, 16, 16, 100);
    let options = InsertOptions::new().with_resampling(Resampling::Average);

    let blocks = patch(&mut s, &mut t, &options, &SilentProgress).unwrap();
    assert_eq!(blocks, Window::new(1, 1, 1, 1));

    assert_eq!(pixel(&mut t, 0, 16, 16), 100);
    assert_eq!(pixel(&mut t, 0, 31, 31), 100);
    assert_eq!(pixel(&mut t, 0, 15, 15), 0);

    assert_eq!(pixel(&mut t, 1, 8, 8), 100);
    assert_eq!(pixel(&mut t, 1, 7, 7), 0);

    assert_eq!(pixel(&mut t, 2, 4, 4), 100);
    assert_eq!(pixel(&mut t, 2, 3, 3), 0);

    assert!(t.cache().dirty_keys().is_empty());
}

#[test]
fn uncovered_pixels_keep_target_content() {
    let mut t = filled_target(7);
    let mut s = source(0, 0, 8, 16, 100);

    let blocks = patch(&mut s, &mut t, &InsertOptions::new(), &SilentProgress).unwrap();
    assert_eq!(blocks, Window::new(0, 0, 1, 1));

    assert_eq!(pixel(&mut t, 0, 0, 0), 100);
    assert_eq!(pixel(&mut t, 0, 7, 15), 100);
    assert_eq!(pixel(&mut t, 0, 8, 0), 7);
    assert_eq!(pixel(&mut t, 0, 0, 16), 7);
}

#[rstest]
#[case(-1, 0)]
#[case(1, 0)]
#[case(0, -1)]
#[case(0, 1)]
fn out_of_bounds_patch_leaves_target_untouched(#[case] dx: i32, #[case] dy: i32) {
    let mut t = filled_target(7);
    let mut s = MemRaster::new(Size::new(64, 64), 1, DataType::Byte)
        .with_geo_transform(geo_at(f64::from(dx), f64::from(dy)));
    s.fill_with(|_, _, _| 100.0);

    let options = InsertOptions::new().with_resampling(Resampling::Nearest);

    assert!(matches!(
        patch(&mut s, &mut t, &options, &SilentProgress),
        Err(PatchError::GeometryMismatch { .. })
    ));

    assert!(t.cache().is_empty());
    assert_eq!(pixel(&mut t, 0, 0, 0), 7);
    assert_eq!(pixel(&mut t, 0, 63, 63), 7);
}

#[test]
fn start_level_skips_base_copy() {
    let mut t = filled_target(7);
    let mut s = source(16, 16, 16, 16, 100);
    let options = InsertOptions::new()
        .with_start_level(1)
        .with_resampling(Resampling::Nearest);

    patch(&mut s, &mut t, &options, &SilentProgress).unwrap();

    assert_eq!(pixel(&mut t, 0, 16, 16), 7);
    assert_eq!(pixel(&mut t, 1, 8, 8), 7);
    // Only the overview blocks covered by the patch are refreshed.
    assert_eq!(pixel(&mut t, 1, 20, 20), 0);
}

#[test]
fn stop_level_limits_refresh() {
    let mut t = target();
    let mut s = source(16, 16, 16, 16, 100);
    let options = InsertOptions::new()
        .with_stop_level(1)
        .with_resampling(Resampling::Average);

    patch(&mut s, &mut t, &options, &SilentProgress).unwrap();

    assert_eq!(pixel(&mut t, 1, 8, 8), 100);
    assert_eq!(pixel(&mut t, 2, 4, 4), 0);
}

#[test]
fn rejects_incompatible_sources() {
    let mut t = target();
    let options = InsertOptions::new();

    let mut wide = MemRaster::new(Size::new(8, 8), 1, DataType::UInt16)
        .with_geo_transform(geo_at(0.0, 0.0));
    assert!(matches!(
        patch(&mut wide, &mut t, &options, &SilentProgress),
        Err(PatchError::DataTypeMismatch { .. })
    ));

    let mut rgb = MemRaster::new(Size::new(8, 8), 3, DataType::Byte)
        .with_geo_transform(geo_at(0.0, 0.0));
    assert!(matches!(
        patch(&mut rgb, &mut t, &options, &SilentProgress),
        Err(PatchError::BandMismatch {
            patch: 3,
            target: 1
        })
    ));

    let mut plain = MemRaster::new(Size::new(8, 8), 1, DataType::Byte);
    assert!(matches!(
        patch(&mut plain, &mut t, &options, &SilentProgress),
        Err(PatchError::NoGeoTransform { side: "patch" })
    ));

    let mut s = source(0, 0, 8, 8, 1);
    assert!(matches!(
        patch(&mut s, &mut t, &options.with_start_level(3), &SilentProgress),
        Err(PatchError::InvalidStartLevel { start: 3, .. })
    ));
}

#[derive(Default)]
struct Recorder {
    events: RefCell<Vec<String>>,
}

impl PatchProgress for Recorder {
    fn stage(&self, stage: PatchStage) {
        self.events.borrow_mut().push(stage.to_string());
    }

    fn blocks_start(&self, total: usize) {
        self.events.borrow_mut().push(format!("blocks {total}"));
    }

    fn block_completed(&self) {
        self.events.borrow_mut().push("block".into());
    }

    fn level_completed(&self, level: usize) {
        self.events.borrow_mut().push(format!("level {level}"));
    }
}

#[test]
fn progress_follows_stages() {
    let mut t = target();
    let mut s = source(8, 8, 16, 8, 100);
    let progress = Recorder::default();
    let options = InsertOptions::new().with_resampling(Resampling::Nearest);

    patch(&mut s, &mut t, &options, &progress).unwrap();

    assert_eq!(
        progress.events.into_inner(),
        [
            "validate",
            "copy base",
            "blocks 2",
            "block",
            "block",
            "propagate overviews",
            "level 1",
            "level 2",
            "done",
        ]
    );
}

fn create(path: &Path, desc: ImageDesc, geo: GeoTransform) -> Pyramid {
    let header = Header {
        geo: Some(geo),
        ..Header::new(desc)
    };

    mrf_tile::create(path, &header).unwrap()
}

#[test]
fn insert_files_in_batch() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("world.mrf");
    let patch_path = dir.path().join("patch.mrf");
    let missing = dir.path().join("missing.mrf");

    drop(create(&target, desc(), geo_at(0.0, 0.0)));

    let patch_desc = ImageDesc::new(Size::new(16, 16), PageSize::new(16, 16, 1), 1, DataType::Byte)
        .with_nodata(0.0);
    let mut p = create(&patch_path, patch_desc, geo_at(16.0, 16.0));
    let req = WindowRequest::new(Window::new(0, 0, 16, 16), 0..1, 1);
    p.write_window(&req, &[100; 256]).unwrap();
    p.flush().unwrap();
    drop(p);

    let options = InsertOptions::new().with_resampling(Resampling::Average);
    let report = Inserter::new(options, SilentProgress).insert_files(&[&patch_path, &missing], &target);

    assert_eq!(report.inserted, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, missing);
    assert!(matches!(
        report.failed[0].1,
        InsertError::OpenSource { .. }
    ));

    let mut world = mrf_tile::open(&target, &mrf_tile::OpenOptions::new()).unwrap();
    assert_eq!(pixel(&mut world, 0, 20, 20), 100);
    assert_eq!(pixel(&mut world, 1, 8, 8), 100);
    assert_eq!(pixel(&mut world, 0, 0, 0), 0);
}

#[test]
fn insert_leaves_source_files_untouched() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("world.mrf");
    let backing = dir.path().join("backing.mrf");
    let patch_path = dir.path().join("patch.mrf");

    drop(create(&target, desc(), geo_at(0.0, 0.0)));

    let patch_desc = ImageDesc::new(Size::new(16, 16), PageSize::new(16, 16, 1), 1, DataType::Byte)
        .with_nodata(0.0);
    let mut b = create(&backing, patch_desc.clone(), geo_at(16.0, 16.0));
    let req = WindowRequest::new(Window::new(0, 0, 16, 16), 0..1, 1);
    b.write_window(&req, &[100; 256]).unwrap();
    b.flush().unwrap();
    drop(b);

    // The patch has no tiles of its own, only a source to fetch them from.
    let header = Header {
        geo: Some(geo_at(16.0, 16.0)),
        source: Some(SourceRef {
            path: "backing.mrf".into(),
            clone: false,
        }),
        ..Header::new(patch_desc)
    };
    drop(mrf_tile::create(&patch_path, &header).unwrap());

    let index_before = std::fs::read(mrf_tile::index_path(&patch_path)).unwrap();
    let data_before = std::fs::read(mrf_tile::data_path(&patch_path)).unwrap();

    Inserter::new(InsertOptions::new(), SilentProgress)
        .insert_file(&patch_path, &target)
        .unwrap();

    assert_eq!(std::fs::read(mrf_tile::index_path(&patch_path)).unwrap(), index_before);
    assert_eq!(std::fs::read(mrf_tile::data_path(&patch_path)).unwrap(), data_before);

    let update = mrf_tile::OpenOptions::new().with_access(mrf_tile::band::Access::Update);
    let mut patch = mrf_tile::open(&patch_path, &update).unwrap();
    assert_eq!(
        patch.tile_idx(&BlockKey::new(0, 0, 0, 0)).unwrap().state(),
        TileState::Hole
    );
}
