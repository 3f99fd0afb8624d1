use std::{error::Error, sync::Arc};

use h5chunk::{
    cache::ChunkCacheConfig,
    fill::{FillTime, FillValue},
    filter::{FilterMask, FilterOptions, FilterPipeline},
    index::{ChunkIndexKind, ChunkIndexTraits, IndexInfo},
    layout::LayoutFlags,
    ChunkedDataset, ChunkedDatasetBuilder, DatasetMessage,
};
use h5chunk_grid::{ArraySubset, Dataspace};
use h5chunk_storage::{store::MemoryBlockStore, FileHandle, FileIntent, FileRegion};

fn memory_file() -> Result<FileHandle, Box<dyn Error>> {
    Ok(FileHandle::new(
        Arc::new(MemoryBlockStore::new()),
        FileIntent::read_write(),
    )?)
}

fn to_bytes(elements: &[i32]) -> Vec<u8> {
    bytemuck::cast_slice(elements).to_vec()
}

fn from_bytes(bytes: &[u8]) -> Vec<i32> {
    bytemuck::pod_collect_to_vec(bytes)
}

#[test]
fn write_then_read_one_chunk() -> Result<(), Box<dyn Error>> {
    let file = memory_file()?;
    let mut dataset = ChunkedDatasetBuilder::new(vec![16], vec![4], 4).build(file.clone())?;
    let subset = ArraySubset::new_with_ranges(&[0..4]);
    dataset.write_subset(&subset, &to_bytes(&[1, 2, 3, 4]))?;
    assert_eq!(from_bytes(&dataset.read_subset(&subset)?), vec![1, 2, 3, 4]);

    // cold
    let message = dataset.close()?;
    let mut dataset = ChunkedDataset::open(file, message, ChunkCacheConfig::disabled())?;
    assert_eq!(from_bytes(&dataset.read_subset(&subset)?), vec![1, 2, 3, 4]);
    assert_eq!(dataset.num_chunks()?, 1);
    Ok(())
}

#[test]
fn read_never_written_chunk_as_fill_value() -> Result<(), Box<dyn Error>> {
    let mut dataset = ChunkedDatasetBuilder::new(vec![16], vec![4], 4)
        .fill_value(FillValue::from_element(-1_i32).with_fill_time(FillTime::Alloc))
        .build(memory_file()?)?;
    dataset.write_subset(&ArraySubset::new_with_ranges(&[0..4]), &to_bytes(&[1, 2, 3, 4]))?;
    assert_eq!(
        from_bytes(&dataset.read_subset(&ArraySubset::new_with_ranges(&[10..11]))?),
        vec![-1]
    );
    assert_eq!(
        from_bytes(&dataset.read_subset(&ArraySubset::new_with_ranges(&[2..6]))?),
        vec![3, 4, -1, -1]
    );
    assert_eq!(dataset.num_chunks()?, 1);
    Ok(())
}

#[test]
fn read_never_written_chunk_with_fill_time_never() -> Result<(), Box<dyn Error>> {
    let mut dataset = ChunkedDatasetBuilder::new(vec![16], vec![4], 4)
        .fill_value(FillValue::from_element(-1_i32).with_fill_time(FillTime::Never))
        .build(memory_file()?)?;
    let file_space = Dataspace::new_with_subset(vec![16], &ArraySubset::new_with_ranges(&[8..12]))?;
    let mem_space = Dataspace::new(vec![4]);
    let mut buf = to_bytes(&[7; 4]);
    dataset.read(&file_space, &mem_space, &mut buf)?;
    assert_eq!(from_bytes(&buf), vec![7; 4]);
    Ok(())
}

#[test]
fn filtered_chunk_round_trip_after_eviction() -> Result<(), Box<dyn Error>> {
    let mut dataset = ChunkedDatasetBuilder::new(vec![8, 8], vec![4, 4], 4)
        .filters(FilterPipeline::new().with_shuffle(4).with_deflate(6))
        .cache_config(ChunkCacheConfig::new(4, 64, 0.75))
        .build(memory_file()?)?;
    let incrementing: Vec<i32> = (0..16).collect();
    let chunk = ArraySubset::new_with_ranges(&[0..4, 0..4]);
    dataset.write_subset(&chunk, &to_bytes(&incrementing))?;
    assert_eq!(dataset.cache().chunks(), vec![vec![0, 0]]);

    for others in [[0..4, 4..8], [4..8, 0..4], [4..8, 4..8]] {
        dataset.write_subset(&ArraySubset::new_with_ranges(&others), &to_bytes(&[0; 16]))?;
    }
    assert!(!dataset.cache().chunks().contains(&vec![0, 0]));
    assert!(dataset.stats().evictions >= 1);

    let info = dataset.chunk_info_by_coord(&[0, 0])?.ok_or("chunk not stored")?;
    assert!(info.size < 64);
    let misses = dataset.stats().misses;
    assert_eq!(from_bytes(&dataset.read_subset(&chunk)?), incrementing);
    assert_eq!(dataset.stats().misses, misses + 1);
    Ok(())
}

#[test]
fn partial_edge_chunk_refiltered_when_complete() -> Result<(), Box<dyn Error>> {
    let mut dataset = ChunkedDatasetBuilder::new(vec![6, 4], vec![4, 4], 4)
        .max_shape(vec![None, Some(4)])
        .flags(LayoutFlags::DONT_FILTER_PARTIAL_BOUND_CHUNKS)
        .filters(FilterPipeline::new().with_fletcher32())
        .build(memory_file()?)?;
    let interior: Vec<i32> = (100..116).collect();
    let edge: Vec<i32> = (0..8).collect();
    dataset.write_subset(&ArraySubset::new_with_ranges(&[0..4, 0..4]), &to_bytes(&interior))?;
    dataset.write_subset(&ArraySubset::new_with_ranges(&[4..6, 0..4]), &to_bytes(&edge))?;
    dataset.flush()?;

    // the edge chunk is stored as is, the interior chunk carries a checksum
    let (filter_mask, stored) = dataset.direct_read(&[4, 0])?;
    assert_eq!(filter_mask, FilterMask::NONE);
    assert_eq!(stored.len(), 64);
    assert_eq!(from_bytes(&stored[..32]), edge);
    assert_eq!(dataset.chunk_info_by_coord(&[0, 0])?.map(|info| info.size), Some(68));

    dataset.set_extent(&[8, 4])?;
    dataset.flush()?;
    let info = dataset.chunk_info_by_coord(&[4, 0])?.ok_or("chunk not stored")?;
    assert_eq!(info.size, 68);
    let (filter_mask, stored) = dataset.direct_read(&[4, 0])?;
    let decoded = dataset
        .filters()
        .reverse(stored.to_vec(), filter_mask, &FilterOptions::default())?;
    assert_eq!(from_bytes(&decoded[..32]), edge);
    assert_eq!(
        from_bytes(&dataset.read_subset(&ArraySubset::new_with_ranges(&[4..6, 0..4]))?),
        edge
    );
    Ok(())
}

#[test]
fn shrink_removes_chunks_beyond_extent() -> Result<(), Box<dyn Error>> {
    let file = memory_file()?;
    let mut dataset = ChunkedDatasetBuilder::new(vec![100], vec![20], 1)
        .fill_value(FillValue::new(vec![255]))
        .build(file.clone())?;
    let content: Vec<u8> = (0..100).collect();
    dataset.write_subset(&ArraySubset::new_with_shape(vec![100]), &content)?;
    dataset.flush()?;
    assert_eq!(dataset.num_chunks()?, 5);
    let removed = [40, 60, 80]
        .into_iter()
        .map(|offset| dataset.chunk_info_by_coord(&[offset]))
        .collect::<Result<Option<Vec<_>>, _>>()?
        .ok_or("chunk not stored")?;

    dataset.set_extent(&[40])?;
    assert_eq!(dataset.num_chunks()?, 2);
    assert_eq!(dataset.allocated_bytes()?, 40);
    let space = file.space();
    for info in removed {
        assert!(!space.is_allocated(FileRegion::new(info.address, info.size)));
    }

    dataset.set_extent(&[60])?;
    let bytes = dataset.read_subset(&ArraySubset::new_with_shape(vec![60]))?;
    assert_eq!(bytes[..40], content[..40]);
    assert_eq!(bytes[40..], [255; 20]);
    Ok(())
}

#[test]
fn shrink_fills_straddling_chunk() -> Result<(), Box<dyn Error>> {
    for cache_config in [ChunkCacheConfig::default(), ChunkCacheConfig::disabled()] {
        let mut dataset = ChunkedDatasetBuilder::new(vec![100], vec![20], 1)
            .max_shape(vec![None])
            .fill_value(FillValue::new(vec![255]))
            .cache_config(cache_config)
            .build(memory_file()?)?;
        let content: Vec<u8> = (0..100).collect();
        dataset.write_subset(&ArraySubset::new_with_shape(vec![100]), &content)?;
        dataset.flush()?;

        dataset.set_extent(&[50])?;
        assert_eq!(dataset.num_chunks()?, 3);
        dataset.set_extent(&[60])?;
        let bytes = dataset.read_subset(&ArraySubset::new_with_shape(vec![60]))?;
        assert_eq!(bytes[..50], content[..50]);
        assert_eq!(bytes[50..], [255; 10]);
    }
    Ok(())
}

#[test]
fn single_chunk_index_records_without_metadata() -> Result<(), Box<dyn Error>> {
    for (filters, size) in [
        (FilterPipeline::new(), 64),
        (FilterPipeline::new().with_fletcher32(), 68),
    ] {
        let file = memory_file()?;
        let mut dataset = ChunkedDatasetBuilder::new(vec![4, 4], vec![4, 4], 4)
            .filters(filters)
            .build(file.clone())?;
        assert_eq!(dataset.index().kind(), ChunkIndexKind::Single);
        let incrementing: Vec<i32> = (0..16).collect();
        dataset.write_subset(&ArraySubset::new_with_shape(vec![4, 4]), &to_bytes(&incrementing))?;
        let written = dataset.chunk_info(0)?.ok_or("chunk not stored")?;
        assert_eq!(written.size, size);
        assert_eq!(written.filter_mask, FilterMask::NONE);

        let json = serde_json::to_string(&dataset.close()?)?;
        let message: DatasetMessage = serde_json::from_str(&json)?;
        let mut dataset = ChunkedDataset::open(file.clone(), message, ChunkCacheConfig::default())?;
        assert_eq!(dataset.chunk_info(0)?, Some(written));
        assert_eq!(dataset.chunk_info(1)?, None);
        assert_eq!(file.eoa(), size);
        let info = IndexInfo {
            file: &file,
            layout: dataset.layout(),
            pipeline: dataset.filters(),
        };
        assert_eq!(dataset.index().size(&info), 0);
        assert_eq!(dataset.index().header_address(), None);
        assert_eq!(
            from_bytes(&dataset.read_subset(&ArraySubset::new_with_shape(vec![4, 4]))?),
            incrementing
        );
    }
    Ok(())
}
