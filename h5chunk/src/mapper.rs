//! Chunk-to-selection mapping.
//!
//! A [`ChunkMap`] partitions the file and memory selections of one I/O call into [`Piece`]s, one per chunk touched by the file selection.
//! The file side of a piece is relative to the chunk origin, the memory side is in memory coordinates, and the two are paired element by element in selection order.

use std::collections::HashMap;

use h5chunk_grid::{
    iterators::ChunkOdometer, ArrayIndices, Dataspace, Hyperslab, IncompatibleDimensionalityError,
    Selection,
};

use crate::{layout::ChunkLayout, ChunkError};

/// The memory side of a [`Piece`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemorySelection<'a> {
    /// The whole memory selection of the I/O call.
    Shared(&'a Dataspace),
    /// A selection owned by the piece.
    Owned(Dataspace),
    /// A contiguous run of elements of the memory extent.
    Contiguous {
        /// The linear offset of the first element.
        offset: u64,
        /// The number of elements.
        length: u64,
    },
}

impl MemorySelection<'_> {
    /// Returns true if the selection is the whole memory selection of the I/O call.
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// Return the selected elements as `(linear offset, length)` runs of the memory extent.
    #[must_use]
    pub fn runs(&self) -> Vec<(u64, u64)> {
        match self {
            Self::Shared(space) => space.runs(),
            Self::Owned(space) => space.runs(),
            Self::Contiguous { offset, length } => vec![(*offset, *length)],
        }
    }
}

/// The part of an I/O call that touches one chunk.
#[derive(Clone, Debug)]
pub struct Piece<'a> {
    scaled: ArrayIndices,
    chunk_index: u64,
    file_selection: Dataspace,
    mem_selection: MemorySelection<'a>,
}

impl<'a> Piece<'a> {
    /// Return the scaled coordinates of the chunk.
    #[must_use]
    pub fn scaled(&self) -> &[u64] {
        &self.scaled
    }

    /// Return the linear index of the chunk.
    #[must_use]
    pub const fn chunk_index(&self) -> u64 {
        self.chunk_index
    }

    /// Return the selection within the chunk.
    #[must_use]
    pub const fn file_selection(&self) -> &Dataspace {
        &self.file_selection
    }

    /// Return the selection in memory.
    #[must_use]
    pub const fn mem_selection(&self) -> &MemorySelection<'a> {
        &self.mem_selection
    }

    /// Return the number of selected elements.
    #[must_use]
    pub fn num_elements(&self) -> u64 {
        self.file_selection.num_elements()
    }
}

enum FileSide {
    Hyperslab(Hyperslab),
    Points(Vec<ArrayIndices>),
}

struct FilePiece {
    scaled: ArrayIndices,
    chunk_index: u64,
    file: FileSide,
}

/// The pieces of one I/O call.
#[derive(Clone, Debug)]
pub struct ChunkMap<'a> {
    pieces: Vec<Piece<'a>>,
    num_elements: u64,
}

impl<'a> ChunkMap<'a> {
    /// Map a file selection and a memory selection onto the chunks of `layout`.
    ///
    /// A single element is mapped directly unless the I/O is `parallel`.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if the file selection does not match the dataset extent or the selections differ in their number of elements.
    pub fn new(
        layout: &ChunkLayout,
        file_space: &Dataspace,
        mem_space: &'a Dataspace,
        parallel: bool,
    ) -> Result<Self, ChunkError> {
        if file_space.dimensionality() != layout.dimensionality() {
            return Err(IncompatibleDimensionalityError::new(
                file_space.dimensionality(),
                layout.dimensionality(),
            )
            .into());
        }
        if file_space.shape() != layout.dims() {
            return Err(ChunkError::InvalidExtent(format!(
                "file dataspace {:?} does not match the dataset extent {:?}",
                file_space.shape(),
                layout.dims()
            )));
        }
        let num_elements = file_space.num_elements();
        if num_elements != mem_space.num_elements() {
            return Err(ChunkError::SelectionMismatch {
                file: num_elements,
                memory: mem_space.num_elements(),
            });
        }
        if num_elements == 0 {
            return Ok(Self {
                pieces: vec![],
                num_elements,
            });
        }

        let file_pieces = if num_elements == 1 && !parallel {
            let indices = file_space.indices().next().unwrap_or_default();
            let scaled = layout.scaled(&indices);
            vec![FilePiece {
                chunk_index: layout.linear_index(&scaled),
                scaled,
                file: FileSide::Points(vec![indices]),
            }]
        } else {
            match file_space.selection() {
                Selection::None => vec![],
                Selection::All | Selection::Hyperslab(_) => {
                    map_hyperslab(layout, file_space, num_elements)?
                }
                Selection::Points(points) => map_points(layout, points),
            }
        };

        let pieces = map_memory(layout, file_space, mem_space, file_pieces)?;
        Ok(Self {
            pieces,
            num_elements,
        })
    }

    /// Return the pieces in chunk order.
    #[must_use]
    pub fn pieces(&self) -> &[Piece<'a>] {
        &self.pieces
    }

    /// Return the number of selected elements.
    #[must_use]
    pub const fn num_elements(&self) -> u64 {
        self.num_elements
    }

    /// Return the number of pieces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    /// Returns true if no chunk is touched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

/// Visit the chunks intersecting the bounding box of an all or hyperslab selection.
fn map_hyperslab(
    layout: &ChunkLayout,
    file_space: &Dataspace,
    num_elements: u64,
) -> Result<Vec<FilePiece>, ChunkError> {
    let all = matches!(file_space.selection(), Selection::All);
    let (Some(hyperslab), Some(bounds)) = (file_space.to_hyperslab(), file_space.bounds()) else {
        return Ok(vec![]);
    };
    let Some(end_inc) = bounds.end_inc() else {
        return Ok(vec![]);
    };
    let odometer = ChunkOdometer::new(layout.scaled(bounds.start()), layout.scaled(&end_inc));

    let mut remaining = num_elements;
    let mut pieces = Vec::new();
    for scaled in odometer {
        let chunk_subset = layout.chunk_subset(&scaled);
        let part = if all {
            Some(Hyperslab::from_subset(&chunk_subset))
        } else {
            hyperslab.intersect(&chunk_subset)?
        };
        let Some(part) = part else {
            continue;
        };
        remaining = remaining.saturating_sub(part.num_elements());
        pieces.push(FilePiece {
            chunk_index: layout.linear_index(&scaled),
            scaled,
            file: FileSide::Hyperslab(part),
        });
        if remaining == 0 {
            break;
        }
    }
    Ok(pieces)
}

/// Group the points of a point selection by chunk.
fn map_points(layout: &ChunkLayout, points: &[ArrayIndices]) -> Vec<FilePiece> {
    let mut pieces: Vec<FilePiece> = Vec::new();
    let mut positions: HashMap<u64, usize> = HashMap::new();
    let mut last: Option<(u64, usize)> = None;
    for point in points {
        let scaled = layout.scaled(point);
        let chunk_index = layout.linear_index(&scaled);
        let position = match last {
            Some((index, position)) if index == chunk_index => position,
            _ => *positions.entry(chunk_index).or_insert_with(|| {
                pieces.push(FilePiece {
                    scaled,
                    chunk_index,
                    file: FileSide::Points(vec![]),
                });
                pieces.len() - 1
            }),
        };
        last = Some((chunk_index, position));
        if let FileSide::Points(chunk_points) = &mut pieces[position].file {
            chunk_points.push(point.clone());
        }
    }
    pieces.sort_by_key(|piece| piece.chunk_index);
    pieces
}

fn map_memory<'a>(
    layout: &ChunkLayout,
    file_space: &Dataspace,
    mem_space: &'a Dataspace,
    file_pieces: Vec<FilePiece>,
) -> Result<Vec<Piece<'a>>, ChunkError> {
    let chunk_shape = layout.chunk_shape().to_vec();
    let to_piece = |file_piece: &FilePiece, mem_selection| -> Result<Piece<'a>, ChunkError> {
        let origin = layout.chunk_origin(&file_piece.scaled);
        let selection = match &file_piece.file {
            FileSide::Hyperslab(hyperslab) => Selection::Hyperslab(hyperslab.relative_to(&origin)?),
            FileSide::Points(points) => Selection::Points(
                points
                    .iter()
                    .map(|point| std::iter::zip(point, &origin).map(|(i, o)| i - o).collect())
                    .collect(),
            ),
        };
        Ok(Piece {
            scaled: file_piece.scaled.clone(),
            chunk_index: file_piece.chunk_index,
            file_selection: Dataspace::new_with_selection(chunk_shape.clone(), selection)?,
            mem_selection,
        })
    };

    if let [file_piece] = file_pieces.as_slice() {
        return Ok(vec![to_piece(file_piece, MemorySelection::Shared(mem_space))?]);
    }

    // same shape: translate each piece into memory
    if let Some(delta) = file_space.translation_to(mem_space) {
        return file_pieces
            .iter()
            .map(|file_piece| {
                let mem_selection = match &file_piece.file {
                    FileSide::Hyperslab(hyperslab) => MemorySelection::Owned(
                        Dataspace::new_with_selection(
                            mem_space.shape().to_vec(),
                            hyperslab.translate(&delta)?.into(),
                        )?,
                    ),
                    FileSide::Points(_) => {
                        return Err(ChunkError::InvalidState(
                            "point selections have no translation".to_string(),
                        ))
                    }
                };
                to_piece(file_piece, mem_selection)
            })
            .collect();
    }

    // 1-D hyperslabs visit chunks in selection order, point lists need not
    let mem_runs = mem_space.runs();
    let is_points = matches!(file_space.selection(), Selection::Points(_));
    if let ([(offset, _)], 1, false) = (mem_runs.as_slice(), file_space.dimensionality(), is_points) {
        let mut offset = *offset;
        return file_pieces
            .iter()
            .map(|file_piece| {
                let length = match &file_piece.file {
                    FileSide::Hyperslab(hyperslab) => hyperslab.num_elements(),
                    FileSide::Points(points) => points.len() as u64,
                };
                let mem_selection = MemorySelection::Contiguous { offset, length };
                offset += length;
                to_piece(file_piece, mem_selection)
            })
            .collect();
    }

    let positions: HashMap<u64, usize> = file_pieces
        .iter()
        .enumerate()
        .map(|(position, file_piece)| (file_piece.chunk_index, position))
        .collect();
    let mut mem_points: Vec<Vec<ArrayIndices>> = vec![Vec::new(); file_pieces.len()];
    let mut last: Option<(ArrayIndices, usize)> = None;
    for (file_indices, mem_indices) in std::iter::zip(file_space.indices(), mem_space.indices()) {
        let scaled = layout.scaled(&file_indices);
        let position = match &last {
            Some((last_scaled, position)) if *last_scaled == scaled => *position,
            _ => {
                let position = positions
                    .get(&layout.linear_index(&scaled))
                    .copied()
                    .ok_or_else(|| {
                        ChunkError::InvalidState(format!("chunk {scaled:?} was not mapped"))
                    })?;
                last = Some((scaled, position));
                position
            }
        };
        mem_points[position].push(mem_indices);
    }
    std::iter::zip(&file_pieces, mem_points)
        .map(|(file_piece, points)| {
            let mem_selection = MemorySelection::Owned(Dataspace::new_with_selection(
                mem_space.shape().to_vec(),
                Selection::Points(points),
            )?);
            to_piece(file_piece, mem_selection)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use h5chunk_grid::ArraySubset;

    use super::*;
    use crate::layout::LayoutFlags;

    fn layout(dims: &[u64], chunk: &[u64]) -> Result<ChunkLayout, ChunkError> {
        let mut layout = ChunkLayout::new(chunk.to_vec(), 1, LayoutFlags::empty())?;
        layout.set_info(dims, &vec![None; dims.len()])?;
        Ok(layout)
    }

    #[test]
    fn chunk_map_all() -> Result<(), Box<dyn std::error::Error>> {
        let layout = layout(&[5, 7], &[2, 4])?;
        let file_space = Dataspace::new(vec![5, 7]);
        let mem_space = Dataspace::new(vec![5, 7]);
        let map = ChunkMap::new(&layout, &file_space, &mem_space, false)?;
        assert_eq!(map.len(), 6);
        assert_eq!(map.num_elements(), 35);
        let last = &map.pieces()[5];
        assert_eq!(last.scaled(), &[2, 1]);
        assert_eq!(last.chunk_index(), 5);
        // partial edge chunk
        assert_eq!(last.num_elements(), 3);
        assert_eq!(last.file_selection().runs(), vec![(0, 3)]);
        assert_eq!(last.mem_selection().runs(), vec![(32, 3)]);
        Ok(())
    }

    #[test]
    fn chunk_map_hyperslab_skips_untouched_chunks() -> Result<(), Box<dyn std::error::Error>> {
        let layout = layout(&[16], &[4])?;
        let hyperslab = Hyperslab::regular(&[1], &[8], &[2], &[2])?;
        let file_space = Dataspace::new_with_selection(vec![16], hyperslab.into())?;
        let mem_space = Dataspace::new(vec![4]);
        let map = ChunkMap::new(&layout, &file_space, &mem_space, false)?;
        let chunks: Vec<u64> = map.pieces().iter().map(Piece::chunk_index).collect();
        assert_eq!(chunks, vec![0, 2]);
        assert_eq!(map.pieces()[1].file_selection().runs(), vec![(1, 2)]);
        assert_eq!(
            map.pieces()[1].mem_selection(),
            &MemorySelection::Contiguous {
                offset: 2,
                length: 2
            }
        );
        Ok(())
    }

    #[test]
    fn chunk_map_translated() -> Result<(), Box<dyn std::error::Error>> {
        let layout = layout(&[8, 8], &[4, 4])?;
        let file_space =
            Dataspace::new_with_subset(vec![8, 8], &ArraySubset::new_with_ranges(&[2..6, 3..5]))?;
        let mem_space =
            Dataspace::new_with_subset(vec![4, 2], &ArraySubset::new_with_ranges(&[0..4, 0..2]))?;
        let map = ChunkMap::new(&layout, &file_space, &mem_space, false)?;
        assert_eq!(map.len(), 4);
        let piece = &map.pieces()[3];
        assert_eq!(piece.scaled(), &[1, 1]);
        assert_eq!(piece.file_selection().runs(), vec![(0, 1), (4, 1)]);
        assert_eq!(piece.mem_selection().runs(), vec![(5, 1), (7, 1)]);
        Ok(())
    }

    #[test]
    fn chunk_map_points() -> Result<(), Box<dyn std::error::Error>> {
        let layout = layout(&[8, 8], &[4, 4])?;
        let file_space = Dataspace::new_with_selection(
            vec![8, 8],
            Selection::Points(vec![vec![7, 7], vec![0, 1], vec![6, 5], vec![0, 0]]),
        )?;
        let mem_space = Dataspace::new(vec![2, 2]);
        let map = ChunkMap::new(&layout, &file_space, &mem_space, false)?;
        assert_eq!(map.len(), 2);
        assert_eq!(map.pieces()[0].chunk_index(), 0);
        assert_eq!(map.pieces()[0].file_selection().runs(), vec![(1, 1), (0, 1)]);
        assert_eq!(map.pieces()[0].mem_selection().runs(), vec![(1, 1), (3, 1)]);
        assert_eq!(map.pieces()[1].file_selection().runs(), vec![(15, 1), (9, 1)]);
        assert_eq!(map.pieces()[1].mem_selection().runs(), vec![(0, 1), (2, 1)]);
        Ok(())
    }

    #[test]
    fn chunk_map_points_out_of_chunk_order() -> Result<(), Box<dyn std::error::Error>> {
        let layout = layout(&[16], &[4])?;
        let file_space = Dataspace::new_with_selection(
            vec![16],
            Selection::Points(vec![vec![9], vec![1], vec![10]]),
        )?;
        let mem_space = Dataspace::new(vec![3]);
        let map = ChunkMap::new(&layout, &file_space, &mem_space, false)?;
        assert_eq!(map.len(), 2);
        assert_eq!(map.pieces()[0].chunk_index(), 0);
        assert_eq!(map.pieces()[0].file_selection().runs(), vec![(1, 1)]);
        assert_eq!(map.pieces()[0].mem_selection().runs(), vec![(1, 1)]);
        assert_eq!(map.pieces()[1].file_selection().runs(), vec![(1, 2)]);
        assert_eq!(map.pieces()[1].mem_selection().runs(), vec![(0, 1), (2, 1)]);
        Ok(())
    }

    #[test]
    fn chunk_map_single_element() -> Result<(), Box<dyn std::error::Error>> {
        let layout = layout(&[16], &[4])?;
        let file_space =
            Dataspace::new_with_subset(vec![16], &ArraySubset::new_with_ranges(&[10..11]))?;
        let mem_space = Dataspace::new(vec![1]);
        let map = ChunkMap::new(&layout, &file_space, &mem_space, false)?;
        assert_eq!(map.len(), 1);
        assert!(map.pieces()[0].mem_selection().is_shared());
        assert_eq!(map.pieces()[0].file_selection().runs(), vec![(2, 1)]);

        let mem_space = Dataspace::new(vec![2]);
        assert!(matches!(
            ChunkMap::new(&layout, &file_space, &mem_space, false),
            Err(ChunkError::SelectionMismatch { file: 1, memory: 2 })
        ));
        Ok(())
    }
}
