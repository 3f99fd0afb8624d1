use std::{collections::HashSet, error::Error, ops::ControlFlow, sync::Arc};

use h5chunk::{
    cache::ChunkCacheConfig,
    collective::SingleProcess,
    config::global_config_mut,
    fill::{AllocTime, FillTime, FillValue},
    filter::{FilterMask, FilterOptions, FilterPipeline},
    index::{ChunkIndexKind, ChunkIndexTraits},
    layout::LayoutFlags,
    ChunkErrorKind, ChunkedDataset, ChunkedDatasetBuilder,
};
use h5chunk_grid::{ArraySubset, Dataspace, Selection};
use h5chunk_storage::{
    storage_adapter::performance_metrics::PerformanceMetricsStorageAdapter,
    store::MemoryBlockStore, FileHandle, FileIntent,
};
use serial_test::serial;

fn memory_file() -> Result<FileHandle, Box<dyn Error>> {
    Ok(FileHandle::new(
        Arc::new(MemoryBlockStore::new()),
        FileIntent::read_write(),
    )?)
}

fn metrics_file(
    intent: FileIntent,
) -> Result<(FileHandle, Arc<PerformanceMetricsStorageAdapter<MemoryBlockStore>>), Box<dyn Error>> {
    let store = Arc::new(PerformanceMetricsStorageAdapter::new(Arc::new(
        MemoryBlockStore::new(),
    )));
    Ok((FileHandle::new(store.clone(), intent)?, store))
}

fn to_bytes(elements: &[i32]) -> Vec<u8> {
    bytemuck::cast_slice(elements).to_vec()
}

fn from_bytes(bytes: &[u8]) -> Vec<i32> {
    bytemuck::pod_collect_to_vec(bytes)
}

#[test]
fn round_trip_across_pipelines_and_caches() -> Result<(), Box<dyn Error>> {
    let pipelines = [
        FilterPipeline::new(),
        FilterPipeline::new().with_shuffle(4).with_deflate(6),
        FilterPipeline::new().with_fletcher32(),
    ];
    for pipeline in pipelines {
        for cache_config in [ChunkCacheConfig::default(), ChunkCacheConfig::disabled()] {
            let file = memory_file()?;
            let mut dataset = ChunkedDatasetBuilder::new(vec![10, 7], vec![4, 3], 4)
                .filters(pipeline.clone())
                .cache_config(cache_config)
                .build(file.clone())?;

            let mut expected: Vec<i32> = (0..70).collect();
            dataset.write_subset(&ArraySubset::new_with_shape(vec![10, 7]), &to_bytes(&expected))?;
            let overwrite = ArraySubset::new_with_ranges(&[2..9, 1..5]);
            let values: Vec<i32> = (0..28).map(|i| -i).collect();
            dataset.write_subset(&overwrite, &to_bytes(&values))?;
            for (indices, value) in overwrite.indices().into_iter().zip(&values) {
                let linear = usize::try_from(indices[0] * 7 + indices[1])?;
                expected[linear] = *value;
            }

            let all = ArraySubset::new_with_shape(vec![10, 7]);
            assert_eq!(from_bytes(&dataset.read_subset(&all)?), expected);
            let message = dataset.close()?;
            let mut dataset = ChunkedDataset::open(file, message, cache_config)?;
            assert_eq!(from_bytes(&dataset.read_subset(&all)?), expected);
            assert_eq!(
                from_bytes(&dataset.read_subset(&ArraySubset::new_with_ranges(&[8..10, 4..7]))?),
                vec![60, 61, 62, 67, 68, 69]
            );
        }
    }
    Ok(())
}

#[test]
fn read_and_write_through_selections() -> Result<(), Box<dyn Error>> {
    let mut dataset = ChunkedDatasetBuilder::new(vec![6, 6], vec![4, 4], 4).build(memory_file()?)?;
    let file_space = Dataspace::new_with_subset(vec![6, 6], &ArraySubset::new_with_ranges(&[3..5, 2..5]))?;
    let mem_space = Dataspace::new_with_subset(vec![3, 4], &ArraySubset::new_with_ranges(&[1..3, 0..3]))?;
    let mut buf = to_bytes(&[0; 12]);
    buf[16..].copy_from_slice(&to_bytes(&[1, 2, 3, 0, 4, 5, 6, 0]));
    dataset.write(&file_space, &mem_space, &buf)?;

    let mut out = to_bytes(&[-1; 6]);
    dataset.read(&file_space, &Dataspace::new(vec![2, 3]), &mut out)?;
    assert_eq!(from_bytes(&out), vec![1, 2, 3, 4, 5, 6]);
    let row = dataset.read_subset(&ArraySubset::new_with_ranges(&[3..4, 0..6]))?;
    assert_eq!(from_bytes(&row), vec![0, 0, 1, 2, 3, 0]);
    Ok(())
}

#[test]
fn point_selections_pair_elements_in_listed_order() -> Result<(), Box<dyn Error>> {
    for cache_config in [ChunkCacheConfig::default(), ChunkCacheConfig::disabled()] {
        let mut dataset = ChunkedDatasetBuilder::new(vec![16], vec![4], 1)
            .cache_config(cache_config)
            .build(memory_file()?)?;
        let points = Selection::Points(vec![vec![9], vec![1], vec![14], vec![10]]);
        let file_space = Dataspace::new_with_selection(vec![16], points)?;
        dataset.write(&file_space, &Dataspace::new(vec![4]), &[0xaa, 0xbb, 0xcc, 0xdd])?;

        let all = dataset.read_subset(&ArraySubset::new_with_shape(vec![16]))?;
        assert_eq!((all[9], all[1], all[14], all[10]), (0xaa, 0xbb, 0xcc, 0xdd));
        let mut out = vec![0; 4];
        dataset.read(&file_space, &Dataspace::new(vec![4]), &mut out)?;
        assert_eq!(out, vec![0xaa, 0xbb, 0xcc, 0xdd]);
    }
    Ok(())
}

#[test]
fn flush_is_idempotent() -> Result<(), Box<dyn Error>> {
    let (file, store) = metrics_file(FileIntent::read_write())?;
    let mut dataset = ChunkedDatasetBuilder::new(vec![16], vec![4], 4)
        .filters(FilterPipeline::new().with_deflate(6))
        .build(file)?;
    dataset.write_subset(&ArraySubset::new_with_ranges(&[2..10]), &to_bytes(&[3; 8]))?;
    assert_eq!(dataset.cache().chunks().len(), 3);
    dataset.flush()?;
    let writes = store.writes();
    assert!(writes >= 3);
    dataset.flush()?;
    assert_eq!(store.writes(), writes);
    assert_eq!(dataset.stats().flushes, 3);
    assert!(!dataset.cache().is_dirty(&[0]));
    Ok(())
}

#[test]
fn fill_value_policy_on_unwritten_chunks() -> Result<(), Box<dyn Error>> {
    let fill_values = [
        FillValue::default(),
        FillValue::new_undefined(),
        FillValue::new(vec![9]),
    ];
    for fill_value in fill_values {
        for fill_time in [FillTime::Alloc, FillTime::Never, FillTime::IfSet] {
            let fill_value = fill_value.clone().with_fill_time(fill_time);
            let mut dataset = ChunkedDatasetBuilder::new(vec![8], vec![4], 1)
                .fill_value(fill_value.clone())
                .build(memory_file()?)?;
            let file_space = Dataspace::new_with_subset(vec![8], &ArraySubset::new_with_ranges(&[2..6]))?;
            let mut buf = vec![0x55; 4];
            dataset.read(&file_space, &Dataspace::new(vec![4]), &mut buf)?;
            if fill_value.skip_missing_chunks() {
                assert_eq!(buf, vec![0x55; 4]);
            } else {
                assert_eq!(buf, vec![fill_value.element(1)[0]; 4]);
            }

            dataset.write_subset(&ArraySubset::new_with_ranges(&[0..1]), &[1])?;
            let chunk = dataset.read_subset(&ArraySubset::new_with_ranges(&[0..4]))?;
            let rest = if fill_value.fill_on_create() {
                fill_value.element(1)[0]
            } else {
                0
            };
            assert_eq!(chunk, vec![1, rest, rest, rest]);
        }
    }
    Ok(())
}

#[test]
fn early_allocation_fills_every_chunk() -> Result<(), Box<dyn Error>> {
    let (file, store) = metrics_file(FileIntent::read_write())?;
    let mut dataset = ChunkedDatasetBuilder::new(vec![30], vec![7], 1)
        .fill_value(FillValue::new(vec![9]).with_alloc_time(AllocTime::Early))
        .build(file)?;
    assert_eq!(dataset.index().kind(), ChunkIndexKind::None);
    assert_eq!(store.writes(), 5);
    assert_eq!(dataset.num_chunks()?, 5);
    assert!(dataset.addr_map()?.iter().all(Option::is_some));
    assert_eq!(
        dataset.read_subset(&ArraySubset::new_with_shape(vec![30]))?,
        vec![9; 30]
    );
    Ok(())
}

#[test]
fn early_allocation_under_parallel_intent_writes_collectively() -> Result<(), Box<dyn Error>> {
    let (file, store) = metrics_file(FileIntent::read_write().with_parallel(true))?;
    let mut dataset = ChunkedDatasetBuilder::new(vec![16], vec![4], 1)
        .max_shape(vec![None])
        .fill_value(FillValue::new(vec![7]).with_alloc_time(AllocTime::Early))
        .build(file)?;
    assert_eq!(store.vector_writes(), 1);
    assert_eq!(
        dataset.read_subset(&ArraySubset::new_with_shape(vec![16]))?,
        vec![7; 16]
    );
    assert!(dataset.cache().chunks().is_empty());

    dataset.set_coordinator(Arc::new(SingleProcess));
    dataset.set_extent(&[24])?;
    assert_eq!(store.vector_writes(), 2);
    assert_eq!(dataset.num_chunks()?, 6);
    assert_eq!(
        dataset.read_subset(&ArraySubset::new_with_ranges(&[16..24]))?,
        vec![7; 8]
    );
    Ok(())
}

#[test]
fn shrink_then_regrow_restores_fill() -> Result<(), Box<dyn Error>> {
    for alloc_time in [AllocTime::Incremental, AllocTime::Early] {
        let mut dataset = ChunkedDatasetBuilder::new(vec![30], vec![7], 1)
            .fill_value(FillValue::new(vec![9]).with_alloc_time(alloc_time))
            .build(memory_file()?)?;
        dataset.write_subset(&ArraySubset::new_with_shape(vec![30]), &[1; 30])?;
        dataset.set_extent(&[10])?;
        assert_eq!(dataset.read_subset(&ArraySubset::new_with_shape(vec![10]))?, vec![1; 10]);
        dataset.set_extent(&[30])?;
        let bytes = dataset.read_subset(&ArraySubset::new_with_shape(vec![30]))?;
        assert_eq!(bytes[..10], [1; 10]);
        assert_eq!(bytes[10..], [9; 20]);
    }
    Ok(())
}

#[test]
fn growing_preserves_content() -> Result<(), Box<dyn Error>> {
    let mut dataset = ChunkedDatasetBuilder::new(vec![5, 5], vec![2, 2], 4)
        .max_shape(vec![None, None])
        .build(memory_file()?)?;
    assert_eq!(dataset.index().kind(), ChunkIndexKind::BTreeV2);
    let content: Vec<i32> = (0..25).collect();
    dataset.write_subset(&ArraySubset::new_with_shape(vec![5, 5]), &to_bytes(&content))?;
    dataset.set_extent(&[9, 7])?;
    assert_eq!(
        from_bytes(&dataset.read_subset(&ArraySubset::new_with_shape(vec![5, 5]))?),
        content
    );
    assert_eq!(
        from_bytes(&dataset.read_subset(&ArraySubset::new_with_ranges(&[4..9, 5..7]))?),
        vec![0; 10]
    );
    assert_eq!(dataset.shape(), &[9, 7]);
    Ok(())
}

#[test]
fn pruning_respects_cache_budget() -> Result<(), Box<dyn Error>> {
    let mut dataset = ChunkedDatasetBuilder::new(vec![256], vec![4], 4)
        .filters(FilterPipeline::new().with_shuffle(4))
        .cache_config(ChunkCacheConfig::new(16, 100, 0.75))
        .build(memory_file()?)?;
    for start in (0..256).step_by(24) {
        let end = std::cmp::min(start + 24, 256);
        let values: Vec<i32> = (start..end).map(|i| i32::try_from(i).unwrap_or_default()).collect();
        dataset.write_subset(&ArraySubset::new_with_ranges(&[start..end]), &to_bytes(&values))?;
        let cache = dataset.cache();
        assert!(cache.nbytes_used() <= 100);
        let chunks = cache.chunks();
        let unique: HashSet<_> = chunks.iter().collect();
        assert_eq!(unique.len(), chunks.len());
        assert_eq!(chunks.len(), cache.nused());
    }
    let expected: Vec<i32> = (0..256).collect();
    assert_eq!(
        from_bytes(&dataset.read_subset(&ArraySubset::new_with_shape(vec![256]))?),
        expected
    );
    Ok(())
}

#[test]
fn stored_chunks_have_storage() -> Result<(), Box<dyn Error>> {
    let mut dataset = ChunkedDatasetBuilder::new(vec![12, 12], vec![5, 5], 4)
        .max_shape(vec![None, Some(12)])
        .filters(FilterPipeline::new().with_deflate(1))
        .build(memory_file()?)?;
    dataset.write_subset(&ArraySubset::new_with_ranges(&[3..11, 0..12]), &to_bytes(&[5; 96]))?;
    let mut visited = 0;
    let flow = dataset.iterate(|info| {
        assert!(info.size > 0);
        assert_eq!(info.filter_mask, FilterMask::NONE);
        visited += 1;
        ControlFlow::Continue(())
    })?;
    assert_eq!(flow, ControlFlow::Continue(()));
    assert_eq!(visited, 9);

    let mut visited = 0;
    let flow = dataset.iterate(|_| {
        visited += 1;
        ControlFlow::Break(())
    })?;
    assert_eq!(flow, ControlFlow::Break(()));
    assert_eq!(visited, 1);
    Ok(())
}

#[test]
fn addr_map_and_dump_index() -> Result<(), Box<dyn Error>> {
    let mut dataset = ChunkedDatasetBuilder::new(vec![12], vec![4], 4)
        .max_shape(vec![None])
        .build(memory_file()?)?;
    dataset.write_subset(&ArraySubset::new_with_ranges(&[4..8]), &to_bytes(&[1, 2, 3, 4]))?;
    let addrs = dataset.addr_map()?;
    assert_eq!(addrs.len(), 3);
    assert!(addrs[0].is_none() && addrs[1].is_some() && addrs[2].is_none());
    assert_eq!(
        addrs[1],
        dataset.chunk_info_by_coord(&[5])?.map(|info| info.address)
    );

    let mut dump = Vec::new();
    dataset.dump_index(&mut dump)?;
    let lines: Vec<serde_json::Value> = String::from_utf8(dump)?
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(lines.len(), 1);
    assert!(!dataset.describe_index().is_empty());
    Ok(())
}

#[test]
fn direct_chunk_write_bypasses_the_pipeline() -> Result<(), Box<dyn Error>> {
    let mut dataset = ChunkedDatasetBuilder::new(vec![8], vec![4], 4)
        .filters(FilterPipeline::new().with_shuffle(4).with_fletcher32())
        .build(memory_file()?)?;
    dataset.write_subset(&ArraySubset::new_with_ranges(&[4..6]), &to_bytes(&[8, 8]))?;
    let (encoded, filter_mask) = dataset
        .filters()
        .apply(to_bytes(&[10, 20, 30, 40]), &FilterOptions::default())?;
    dataset.direct_write(&[4], filter_mask, &encoded)?;
    assert!(dataset.cache().chunks().is_empty());
    assert_eq!(
        from_bytes(&dataset.read_subset(&ArraySubset::new_with_ranges(&[4..8]))?),
        vec![10, 20, 30, 40]
    );
    let (mask, stored) = dataset.direct_read(&[4])?;
    assert_eq!((mask, stored.to_vec()), (filter_mask, encoded));

    assert!(dataset.direct_write(&[2], filter_mask, &[1, 2, 3]).is_err());
    assert_eq!(
        dataset.direct_read(&[0]).map_err(|err| err.kind()).err(),
        Some(ChunkErrorKind::Contract)
    );
    Ok(())
}

#[test]
fn format_convert_filters_edge_chunks() -> Result<(), Box<dyn Error>> {
    let mut dataset = ChunkedDatasetBuilder::new(vec![6, 4], vec![4, 4], 4)
        .max_shape(vec![None, Some(4)])
        .flags(LayoutFlags::DONT_FILTER_PARTIAL_BOUND_CHUNKS)
        .filters(FilterPipeline::new().with_fletcher32())
        .build(memory_file()?)?;
    let content: Vec<i32> = (0..24).collect();
    let all = ArraySubset::new_with_shape(vec![6, 4]);
    dataset.write_subset(&all, &to_bytes(&content))?;
    assert_eq!(dataset.chunk_info_by_coord(&[4, 0])?.map(|info| info.size), Some(64));

    dataset.format_convert(ChunkIndexKind::BTreeV1)?;
    assert_eq!(dataset.index().kind(), ChunkIndexKind::BTreeV1);
    assert!(!dataset
        .layout()
        .flags()
        .contains(LayoutFlags::DONT_FILTER_PARTIAL_BOUND_CHUNKS));
    assert_eq!(dataset.chunk_info_by_coord(&[4, 0])?.map(|info| info.size), Some(68));
    assert_eq!(from_bytes(&dataset.read_subset(&all)?), content);

    dataset.format_convert(ChunkIndexKind::BTreeV2)?;
    assert_eq!(dataset.num_chunks()?, 2);
    assert_eq!(from_bytes(&dataset.read_subset(&all)?), content);
    assert!(dataset.format_convert(ChunkIndexKind::None).is_err());
    Ok(())
}

#[test]
fn copy_and_delete_storage() -> Result<(), Box<dyn Error>> {
    for alloc_time in [AllocTime::Incremental, AllocTime::Early] {
        let mut dataset = ChunkedDatasetBuilder::new(vec![12], vec![4], 4)
            .fill_value(FillValue::from_element(-1_i32).with_alloc_time(alloc_time))
            .build(memory_file()?)?;
        dataset.write_subset(&ArraySubset::new_with_ranges(&[0..6]), &to_bytes(&[4; 6]))?;
        let all = ArraySubset::new_with_shape(vec![12]);
        let content = dataset.read_subset(&all)?;

        let mut copy = dataset.copy_to(memory_file()?)?;
        assert_eq!(copy.index().kind(), dataset.index().kind());
        assert_eq!(copy.read_subset(&all)?, content);
        assert_eq!(copy.num_chunks()?, dataset.num_chunks()?);

        dataset.delete_storage()?;
        if alloc_time == AllocTime::Incremental {
            assert_eq!(dataset.num_chunks()?, 0);
            assert_eq!(from_bytes(&dataset.read_subset(&all)?), vec![-1; 12]);
        }
        assert_eq!(copy.read_subset(&all)?, content);
    }
    Ok(())
}

#[test]
fn read_only_file_rejects_writes() -> Result<(), Box<dyn Error>> {
    let store = Arc::new(MemoryBlockStore::new());
    let file = FileHandle::new(store.clone(), FileIntent::read_write())?;
    let mut dataset = ChunkedDatasetBuilder::new(vec![8], vec![4], 1).build(file)?;
    dataset.write_subset(&ArraySubset::new_with_shape(vec![8]), &[2; 8])?;
    let message = dataset.close()?;

    let file = FileHandle::new(store, FileIntent::read_only())?;
    let mut dataset = ChunkedDataset::open(file, message, ChunkCacheConfig::default())?;
    assert_eq!(dataset.read_subset(&ArraySubset::new_with_shape(vec![8]))?, vec![2; 8]);
    let err = dataset
        .write_subset(&ArraySubset::new_with_shape(vec![8]), &[3; 8])
        .map_err(|err| err.kind())
        .err();
    assert_eq!(err, Some(ChunkErrorKind::Contract));
    assert!(dataset.set_extent(&[4]).is_err());
    Ok(())
}

#[test]
fn logs_extent_changes_and_cache_statistics() -> Result<(), Box<dyn Error>> {
    testing_logger::setup();
    let mut dataset = ChunkedDatasetBuilder::new(vec![4], vec![4], 1)
        .max_shape(vec![None])
        .build(memory_file()?)?;
    dataset.set_extent(&[8])?;
    dataset.stats();
    testing_logger::validate(|captured_logs| {
        assert!(captured_logs
            .iter()
            .any(|log| log.level == log::Level::Debug && log.body == "extent changed from [4] to [8]"));
        assert!(captured_logs
            .iter()
            .any(|log| log.level == log::Level::Debug && log.body.starts_with("chunk cache: ")));
    });
    Ok(())
}

fn vector_writes_with_selection_io(selection_io: bool) -> Result<usize, Box<dyn Error>> {
    global_config_mut().set_selection_io(selection_io);
    let (file, store) = metrics_file(FileIntent::read_write())?;
    let mut dataset = ChunkedDatasetBuilder::new(vec![64], vec![16], 1)
        .fill_value(FillValue::new_undefined())
        .cache_config(ChunkCacheConfig::new(8, 8, 0.75))
        .build(file)?;
    let content: Vec<u8> = (0..64).collect();
    dataset.write_subset(&ArraySubset::new_with_shape(vec![64]), &content)?;
    assert_eq!(dataset.read_subset(&ArraySubset::new_with_shape(vec![64]))?, content);
    Ok(store.vector_writes())
}

#[test]
#[serial]
fn selection_io_gathers_direct_requests() -> Result<(), Box<dyn Error>> {
    let gathered = vector_writes_with_selection_io(true);
    let separate = vector_writes_with_selection_io(false);
    global_config_mut().set_selection_io(true);
    assert_eq!(gathered?, 1);
    assert_eq!(separate?, 4);
    Ok(())
}

fn read_corrupted_chunk() -> Result<Vec<u8>, Box<dyn Error>> {
    let file = memory_file()?;
    let mut dataset = ChunkedDatasetBuilder::new(vec![4], vec![4], 4)
        .filters(FilterPipeline::new().with_fletcher32())
        .build(file.clone())?;
    dataset.write_subset(&ArraySubset::new_with_shape(vec![4]), &to_bytes(&[1, 2, 3, 4]))?;
    let info = dataset.chunk_info(0)?.ok_or("chunk not stored")?;
    let message = dataset.close()?;
    file.write(info.address, &[0xff])?;

    let mut dataset = ChunkedDataset::open(file, message, ChunkCacheConfig::disabled())?;
    match dataset.read_subset(&ArraySubset::new_with_shape(vec![4])) {
        Ok(bytes) => Ok(bytes),
        Err(err) => {
            assert_eq!(err.kind(), ChunkErrorKind::Filter);
            dataset.set_filter_options(FilterOptions::default().with_validate_checksums(false));
            assert_ne!(dataset.read_subset(&ArraySubset::new_with_shape(vec![4]))?[0], 1);
            Err(err.into())
        }
    }
}

#[test]
#[serial]
fn checksum_validation_can_be_disabled() -> Result<(), Box<dyn Error>> {
    assert!(read_corrupted_chunk().is_err());
    global_config_mut().set_validate_checksums(false);
    let corrupted = read_corrupted_chunk();
    global_config_mut().set_validate_checksums(true);
    let corrupted = from_bytes(&corrupted?);
    assert_ne!(corrupted[0], 1);
    assert_eq!(corrupted[1..], [2, 3, 4]);
    Ok(())
}

#[test]
#[serial]
fn cache_defaults_follow_the_global_config() {
    global_config_mut()
        .set_chunk_cache_nslots(7)
        .set_chunk_cache_nbytes(4096);
    let config = ChunkCacheConfig::default();
    global_config_mut()
        .set_chunk_cache_nslots(521)
        .set_chunk_cache_nbytes(1024 * 1024);
    assert_eq!((config.nslots(), config.nbytes()), (7, 4096));
    assert_eq!(ChunkCacheConfig::default().nbytes(), 1024 * 1024);
}
