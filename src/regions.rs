use bevy::log::warn;

use crate::{
    get_cell_offset, get_neighbour_index,
    heightfields::{OpenSpan, OpenTile},
    Area, NavMeshSettings, PartitionType,
};

#[derive(Default, Clone, Copy)]
struct LevelStackEntry {
    cell_index: u32,
    span_index: u32,
    index: i32,
}

/// Partitions the walkable surface of the tile into regions, using the
/// partitioner selected in the settings. Watershed requires
/// [calculate_distance_field](crate::heightfields::calculate_distance_field)
/// to have run on the tile.
pub fn build_regions(open_tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    match nav_mesh_settings.partition_type {
        PartitionType::Watershed => build_regions_watershed(open_tile, nav_mesh_settings),
        PartitionType::Monotone => build_regions_monotone(open_tile, nav_mesh_settings),
        PartitionType::Layers => build_regions_layers(open_tile, nav_mesh_settings),
    }
}

fn build_regions_watershed(tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let expand_iters = 4 + nav_mesh_settings.walkable_radius * 2;

    const LOG_NB_STACKS: i32 = 3;
    const NB_STACKS: i32 = 1 << LOG_NB_STACKS; // 8.

    let mut regions = vec![0; tile.span_count];
    let mut distances = vec![0; tile.span_count];

    let mut level_stacks: [Vec<LevelStackEntry>; NB_STACKS as usize] = Default::default();
    for stack in level_stacks.iter_mut() {
        stack.reserve(256);
    }
    let mut stack = Vec::with_capacity(256);

    let mut region_id = 1u16;
    let mut level = (tile.max_distance + 1) & !1u16; // Rounded.

    let mut stack_id = -1;
    while level > 0 {
        level = if level >= 2 { level - 2 } else { 0 };
        stack_id = (stack_id + 1) & (NB_STACKS - 1);

        if stack_id == 0 {
            // Sort cells by level.
            sort_cells_by_level(level, tile, &mut level_stacks, NB_STACKS, &regions);
        } else {
            // append stacks
            let prev_stack = (stack_id - 1) as usize;
            let next_stack = stack_id as usize;
            for i in 0..level_stacks[prev_stack].len() {
                if regions[level_stacks[prev_stack][i].index as usize] != 0 {
                    continue;
                }

                let entry = level_stacks[prev_stack][i];
                level_stacks[next_stack].push(entry);
            }
        }

        // expand regions.
        expand_regions(
            nav_mesh_settings,
            expand_iters,
            tile,
            &mut regions,
            &mut distances,
            &mut level_stacks[stack_id as usize],
        );

        // Mark new regions with IDs.
        for i in 0..level_stacks[stack_id as usize].len() {
            let entry = level_stacks[stack_id as usize][i];
            if entry.index >= 0
                && regions[entry.index as usize] == 0
                && flood_region(
                    nav_mesh_settings,
                    entry,
                    level,
                    region_id,
                    tile,
                    &mut regions,
                    &mut distances,
                    &mut stack,
                )
            {
                region_id += 1;
            }
        }
    }

    // Expand regions until no empty connected cells are found.
    expand_regions_until_end(
        nav_mesh_settings,
        tile,
        &mut regions,
        &mut distances,
        &mut stack,
    );

    // Merge regions and filter out small ones.
    merge_and_filter_regions(nav_mesh_settings, &mut regions, &mut region_id, tile);

    // Write results into spans.
    for cell in tile.cells.iter_mut() {
        for span in cell.spans.iter_mut() {
            span.region = regions[span.tile_index];
        }
    }

    tile.max_regions = region_id;
}

fn sort_cells_by_level(
    start_level: u16,
    open_tile: &OpenTile,
    stacks: &mut [Vec<LevelStackEntry>],
    nb_stacks: i32, // always NB_STACKS
    regions: &[u16],
) {
    let start_level = (start_level >> 1) as i32;

    for stack in stacks.iter_mut() {
        stack.clear();
    }

    for (c_i, cell) in open_tile.cells.iter().enumerate() {
        for (s_i, span) in cell.spans.iter().enumerate() {
            if open_tile.areas[span.tile_index].is_none() || regions[span.tile_index] != 0 {
                continue;
            }

            let level = (open_tile.distances[span.tile_index] >> 1) as i32;
            let stack_id = (start_level - level).max(0);
            if stack_id >= nb_stacks {
                continue;
            }

            stacks[stack_id as usize].push(LevelStackEntry {
                cell_index: c_i as u32,
                span_index: s_i as u32,
                index: span.tile_index as i32,
            });
        }
    }
}

struct DirtyEntry {
    index: i32,
    region: u16,
    distance: u16,
}

fn expand_regions(
    nav_mesh_settings: &NavMeshSettings,
    max_iterations: u16,
    tile: &OpenTile,
    regions: &mut [u16],
    distances: &mut [u16],
    level_stack: &mut [LevelStackEntry],
) {
    for entry in level_stack
        .iter_mut()
        .filter(|entry| regions[entry.index as usize] != 0)
    {
        entry.index = -1;
    }

    let mut iter = 0;
    let mut dirty_entries = Vec::new();
    loop {
        let mut failed = 0;
        dirty_entries.clear();

        for entry in level_stack.iter_mut() {
            if entry.index < 0 {
                failed += 1;
                continue;
            }

            let mut new_region = regions[entry.index as usize];
            let mut distance = u16::MAX;
            let span = &tile.cells[entry.cell_index as usize].spans[entry.span_index as usize];
            let area = tile.areas[entry.index as usize];

            for dir in 0..4 {
                let Some(index) = span.neighbours[dir] else {
                    continue;
                };

                let other_span = &tile.cells[(entry.cell_index as isize
                    + get_cell_offset(nav_mesh_settings, dir))
                    as usize]
                    .spans[index as usize];

                if tile.areas[other_span.tile_index] != area {
                    continue;
                }

                let other_region = regions[other_span.tile_index];
                let other_distance = distances[other_span.tile_index];
                if other_region > 0 && other_distance + 2 < distance {
                    new_region = other_region;
                    distance = other_distance + 2;
                }
            }

            if new_region != 0 {
                entry.index = -1;
                dirty_entries.push(DirtyEntry {
                    index: span.tile_index as i32,
                    region: new_region,
                    distance,
                });
            } else {
                failed += 1;
            }
        }

        // Copy entries that differ between src and st to keep them in sync.
        for entry in dirty_entries.iter() {
            regions[entry.index as usize] = entry.region;
            distances[entry.index as usize] = entry.distance;
        }

        if failed == level_stack.len() {
            break;
        }

        iter += 1;
        if iter >= max_iterations {
            break;
        }
    }
}

fn expand_regions_until_end(
    nav_mesh_settings: &NavMeshSettings,
    tile: &OpenTile,
    regions: &mut [u16],
    distances: &mut [u16],
    level_stack: &mut Vec<LevelStackEntry>,
) {
    level_stack.clear();

    for (c_i, cell) in tile.cells.iter().enumerate() {
        for (s_i, span) in cell.spans.iter().enumerate() {
            if tile.areas[span.tile_index].is_some() && regions[span.tile_index] == 0 {
                level_stack.push(LevelStackEntry {
                    cell_index: c_i as u32,
                    span_index: s_i as u32,
                    index: span.tile_index as i32,
                });
            }
        }
    }

    let mut dirty_entries = Vec::new();
    let mut failed = 0;
    while failed < level_stack.len() {
        failed = 0;
        dirty_entries.clear();

        for entry in level_stack.iter_mut() {
            if entry.index < 0 {
                failed += 1;
                continue;
            }

            let mut new_region = regions[entry.index as usize];
            let mut distance = u16::MAX;
            let span = &tile.cells[entry.cell_index as usize].spans[entry.span_index as usize];
            let area = tile.areas[entry.index as usize];

            for dir in 0..4 {
                let Some(index) = span.neighbours[dir] else {
                    continue;
                };

                let other_span = &tile.cells[(entry.cell_index as isize
                    + get_cell_offset(nav_mesh_settings, dir))
                    as usize]
                    .spans[index as usize];

                if tile.areas[other_span.tile_index] != area {
                    continue;
                }

                let other_region = regions[other_span.tile_index];
                let other_distance = distances[other_span.tile_index];
                if other_region > 0 && other_distance + 2 < distance {
                    new_region = other_region;
                    distance = other_distance + 2;
                }
            }

            if new_region != 0 {
                entry.index = -1;
                dirty_entries.push(DirtyEntry {
                    index: span.tile_index as i32,
                    region: new_region,
                    distance,
                });
            } else {
                failed += 1;
            }
        }

        for entry in dirty_entries.iter() {
            regions[entry.index as usize] = entry.region;
            distances[entry.index as usize] = entry.distance;
        }

        if failed == level_stack.len() {
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn flood_region(
    nav_mesh_settings: &NavMeshSettings,
    entry: LevelStackEntry,
    level: u16,
    region_id: u16,
    tile: &OpenTile,
    regions: &mut [u16],
    distances: &mut [u16],
    stack: &mut Vec<LevelStackEntry>,
) -> bool {
    let area = tile.areas[entry.index as usize];

    stack.clear();
    stack.push(entry);

    regions[entry.index as usize] = region_id;
    distances[entry.index as usize] = 0;

    let mut count = 0;

    while let Some(entry) = stack.pop() {
        let span = &tile.cells[entry.cell_index as usize].spans[entry.span_index as usize];

        let mut adjacent_region = 0;
        for dir in 0..4 {
            let Some(index) = span.neighbours[dir] else {
                continue;
            };

            let other_cell_index =
                (entry.cell_index as isize + get_cell_offset(nav_mesh_settings, dir)) as usize;
            let other_span = &tile.cells[other_cell_index].spans[index as usize];

            if tile.areas[other_span.tile_index] != area {
                continue;
            }

            let other_region = regions[other_span.tile_index];
            if other_region != 0 && other_region != region_id {
                adjacent_region = other_region;
                break;
            }

            let next_dir = (dir + 1) & 0x3;
            if let Some(index) = other_span.neighbours[next_dir] {
                let diagonal_span = &tile.cells[(other_cell_index as isize
                    + get_cell_offset(nav_mesh_settings, next_dir))
                    as usize]
                    .spans[index as usize];

                if tile.areas[diagonal_span.tile_index] != area {
                    continue;
                }

                let other_region = regions[diagonal_span.tile_index];
                if other_region != 0 && other_region != region_id {
                    adjacent_region = other_region;
                    break;
                }
            }
        }

        if adjacent_region != 0 {
            regions[entry.index as usize] = 0;
            continue;
        }

        count += 1;

        for dir in 0..4 {
            let Some(index) = span.neighbours[dir] else {
                continue;
            };

            let other_cell_index =
                (entry.cell_index as isize + get_cell_offset(nav_mesh_settings, dir)) as usize;
            let other_span = &tile.cells[other_cell_index].spans[index as usize];

            if tile.areas[other_span.tile_index] != area {
                continue;
            }

            if tile.distances[other_span.tile_index] >= level && regions[other_span.tile_index] == 0
            {
                regions[other_span.tile_index] = region_id;
                distances[other_span.tile_index] = 0;
                stack.push(LevelStackEntry {
                    cell_index: other_cell_index as u32,
                    span_index: index.into(),
                    index: other_span.tile_index as i32,
                })
            }
        }
    }

    count > 0
}

#[derive(Default, Clone, Copy)]
struct SweepSpan {
    region: u16,
    sample_count: u16,
    neighbour: Option<u16>,
    neighbour_valid: bool,
}

fn build_regions_monotone(tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let mut regions = vec![0u16; tile.span_count];
    let mut region_id = monotone_partition(tile, nav_mesh_settings, None, &mut regions);

    merge_and_filter_regions(nav_mesh_settings, &mut regions, &mut region_id, tile);

    for cell in tile.cells.iter_mut() {
        for span in cell.spans.iter_mut() {
            span.region = regions[span.tile_index];
        }
    }

    tile.max_regions = region_id;
}

fn build_regions_layers(tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let (floors, _) = assign_layer_floors(tile, nav_mesh_settings);

    let mut regions = vec![0u16; tile.span_count];
    let mut region_id = monotone_partition(tile, nav_mesh_settings, Some(&floors), &mut regions);

    merge_and_filter_regions(nav_mesh_settings, &mut regions, &mut region_id, tile);

    for cell in tile.cells.iter_mut() {
        for span in cell.spans.iter_mut() {
            span.region = regions[span.tile_index];
        }
    }

    tile.max_regions = region_id;
}

/// Row sweep partitioning. When ``floors`` is supplied, sweeps never cross
/// floor boundaries, so every region stays within one 2.5D layer.
///
/// Returns one past the highest region id allocated.
pub(crate) fn monotone_partition(
    tile: &OpenTile,
    nav_mesh_settings: &NavMeshSettings,
    floors: Option<&[u8]>,
    regions: &mut [u16],
) -> u16 {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();

    let mut region_id = 1u16;
    let mut sweeps: Vec<SweepSpan> = Vec::with_capacity(tile_side);
    let mut sweep_of_span = vec![u16::MAX; tile.span_count];
    let mut previous_counts: Vec<u16> = Vec::new();

    let same_floor = |a: usize, b: usize| match floors {
        Some(floors) => floors[a] == floors[b],
        None => true,
    };

    for row in 0..tile_side {
        sweeps.clear();
        previous_counts.clear();
        previous_counts.resize(region_id as usize, 0);

        for column in 0..tile_side {
            let cell_index = column + row * tile_side;
            let cell = &tile.cells[cell_index];

            for span in cell.spans.iter() {
                let area = tile.areas[span.tile_index];
                if area.is_none() {
                    continue;
                }

                // Continue the sweep of the -x neighbour when connected.
                let mut sweep_id = u16::MAX;
                if let Some(index) = span.neighbours[0] {
                    let other_span = &tile.cells[cell_index - 1].spans[index as usize];
                    if tile.areas[other_span.tile_index] == area
                        && same_floor(span.tile_index, other_span.tile_index)
                    {
                        sweep_id = sweep_of_span[other_span.tile_index];
                    }
                }

                if sweep_id == u16::MAX {
                    sweep_id = sweeps.len() as u16;
                    sweeps.push(SweepSpan {
                        region: 0,
                        sample_count: 0,
                        neighbour: None,
                        neighbour_valid: true,
                    });
                }

                // Count the -z neighbour's region so the sweep can adopt it
                // if it turns out to be the sweep's only neighbour.
                if let Some(index) = span.neighbours[3] {
                    let other_span = &tile.cells[cell_index - tile_side].spans[index as usize];
                    let other_region = regions[other_span.tile_index];

                    if other_region != 0
                        && tile.areas[other_span.tile_index] == area
                        && same_floor(span.tile_index, other_span.tile_index)
                    {
                        let sweep = &mut sweeps[sweep_id as usize];
                        sweep.sample_count += 1;
                        previous_counts[other_region as usize] += 1;

                        match sweep.neighbour {
                            None => sweep.neighbour = Some(other_region),
                            Some(neighbour) if neighbour != other_region => {
                                sweep.neighbour_valid = false;
                            }
                            _ => {}
                        }
                    }
                }

                sweep_of_span[span.tile_index] = sweep_id;
            }
        }

        // Resolve the row's sweeps to region ids.
        for sweep in sweeps.iter_mut() {
            if let Some(neighbour) = sweep.neighbour.filter(|_| sweep.neighbour_valid) {
                // Merge only when the neighbour region touches nothing else
                // in this row.
                if previous_counts[neighbour as usize] == sweep.sample_count {
                    sweep.region = neighbour;
                    continue;
                }
            }

            sweep.region = region_id;
            region_id += 1;
        }

        for column in 0..tile_side {
            let cell = &tile.cells[column + row * tile_side];
            for span in cell.spans.iter() {
                let sweep_id = sweep_of_span[span.tile_index];
                if sweep_id != u16::MAX {
                    regions[span.tile_index] = sweeps[sweep_id as usize].region;
                }
            }
        }
    }

    region_id
}

/// The maximum number of 2.5D floors in one tile. Bounded by the 8-bit layer
/// index of the tile cache.
pub(crate) const MAX_LAYER_FLOORS: usize = 255;
pub(crate) const NO_FLOOR: u8 = u8::MAX;

/// Flood-fills the walkable surface into connected components ("floors").
/// Spans of the same column always end up in different floors since they are
/// never 4-connected to each other.
pub(crate) fn assign_layer_floors(
    tile: &OpenTile,
    nav_mesh_settings: &NavMeshSettings,
) -> (Vec<u8>, usize) {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();

    let mut floors = vec![NO_FLOOR; tile.span_count];
    let mut floor_count = 0usize;
    let mut stack = Vec::with_capacity(256);

    for (cell_index, cell) in tile.cells.iter().enumerate() {
        for (span_index, span) in cell.spans.iter().enumerate() {
            if tile.areas[span.tile_index].is_none() || floors[span.tile_index] != NO_FLOOR {
                continue;
            }

            if floor_count >= MAX_LAYER_FLOORS {
                warn!("Tile exceeds {MAX_LAYER_FLOORS} floors, ignoring the rest.");
                return (floors, floor_count);
            }

            let floor = floor_count as u8;
            floor_count += 1;

            floors[span.tile_index] = floor;
            stack.clear();
            stack.push((cell_index, span_index));

            while let Some((cell_index, span_index)) = stack.pop() {
                let span = &tile.cells[cell_index].spans[span_index];

                for dir in 0..4 {
                    let Some(index) = span.neighbours[dir] else {
                        continue;
                    };

                    let other_cell_index = get_neighbour_index(tile_side, cell_index, dir);
                    let other_span = &tile.cells[other_cell_index].spans[index as usize];

                    if tile.areas[other_span.tile_index].is_none()
                        || floors[other_span.tile_index] != NO_FLOOR
                    {
                        continue;
                    }

                    floors[other_span.tile_index] = floor;
                    stack.push((other_cell_index, index as usize));
                }
            }
        }
    }

    (floors, floor_count)
}

struct Region {
    id: u16,
    span_count: usize,
    remap: bool,
    visited: bool,
    overlap: bool,
    is_border_region: bool,
    area: Option<Area>,
    floors: Vec<u16>,
    connections: Vec<u16>,
}

fn merge_and_filter_regions(
    nav_mesh_settings: &NavMeshSettings,
    source_regions: &mut [u16],
    max_region_id: &mut u16,
    tile: &OpenTile,
) {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();
    let border = usize::from(nav_mesh_settings.walkable_radius);

    let mut regions = Vec::with_capacity(*max_region_id as usize);
    for i in 0..*max_region_id {
        regions.push(Region {
            id: i,
            span_count: 0,
            remap: false,
            visited: false,
            overlap: false,
            is_border_region: false,
            area: None,
            floors: Vec::new(),
            connections: Vec::new(),
        });
    }

    for (c_i, cell) in tile.cells.iter().enumerate() {
        let row = c_i / tile_side;
        let column = c_i % tile_side;
        // Regions reaching the seam between tiles must survive filtering so
        // neighbouring tiles connect.
        let is_border = row <= border
            || column <= border
            || row >= tile_side - border - 1
            || column >= tile_side - border - 1;

        for (s_i, span) in cell.spans.iter().enumerate() {
            let region_id = source_regions[span.tile_index];
            if region_id == 0 || region_id >= *max_region_id {
                continue;
            }

            let region = &mut regions[region_id as usize];
            region.span_count += 1;
            region.is_border_region |= is_border;
            region.area = tile.areas[span.tile_index];

            // Update floors
            for other_span in cell
                .spans
                .iter()
                .filter(|a| a.tile_index != span.tile_index)
            {
                let other_region_id = source_regions[other_span.tile_index];
                if other_region_id == 0 || other_region_id >= *max_region_id {
                    continue;
                }
                if other_region_id == region_id {
                    region.overlap = true;
                }

                add_unique_floor_region(region, other_region_id);
            }

            // Contour already exists.
            if !region.connections.is_empty() {
                continue;
            }

            let dir = (0..4)
                .find(|dir| is_solid_edge(nav_mesh_settings, tile, span, c_i, *dir, source_regions));

            if let Some(dir) = dir {
                let mut connections = std::mem::take(&mut regions[region_id as usize].connections);
                walk_region_edge(
                    c_i,
                    s_i,
                    dir,
                    tile,
                    nav_mesh_settings,
                    source_regions,
                    &mut connections,
                );
                regions[region_id as usize].connections = connections;
            }
        }
    }

    // Remove too small regions.
    let mut stack = Vec::with_capacity(32);
    let mut trace = Vec::with_capacity(32);
    let mut connections: Vec<u16> = Vec::with_capacity(16);

    for i in 0..*max_region_id {
        {
            let region = &mut regions[i as usize];
            if region.id == 0 || region.span_count == 0 || region.visited {
                continue;
            }

            region.visited = true;
        }

        let mut connects_to_border = false;

        stack.clear();
        trace.clear();

        stack.push(i);

        let mut span_count = 0;

        while let Some(r_i) = stack.pop() {
            connections.clear();
            trace.push(r_i);

            {
                let region = &regions[r_i as usize];
                connections.extend(region.connections.iter());
                span_count += region.span_count;
                connects_to_border |= region.is_border_region;
            }

            for connected_region in &connections {
                if *connected_region == 0 {
                    continue;
                }

                let connected_region = &mut regions[*connected_region as usize];

                if connected_region.visited {
                    continue;
                }

                stack.push(connected_region.id);
                connected_region.visited = true;
            }
        }

        if (span_count as u32) < nav_mesh_settings.min_region_area && !connects_to_border {
            for trace in &trace {
                let region = &mut regions[*trace as usize];
                region.span_count = 0;
                region.id = 0;
            }
        }
    }

    // Merge small regions into their neighbours.
    loop {
        let mut merged = false;

        for region_index in 0..regions.len() {
            {
                let region = &regions[region_index];
                if region.id == 0 || region.overlap || region.span_count == 0 {
                    continue;
                }

                // Big regions bordering unwalkable space stay as they are.
                if region.span_count as u32 > nav_mesh_settings.max_region_area_to_merge_into
                    && region.connections.contains(&0)
                {
                    continue;
                }
            }

            // Smallest mergeable neighbour; ties broken by the smaller id.
            let mut smallest_region_size = usize::MAX;
            let mut merge_id = None;
            {
                let region = &regions[region_index];
                for connected in &region.connections {
                    if *connected == 0 {
                        continue;
                    }

                    let other_region = &regions[*connected as usize];
                    if other_region.id == 0 || other_region.overlap {
                        continue;
                    }

                    let better = other_region.span_count < smallest_region_size
                        || (other_region.span_count == smallest_region_size
                            && merge_id.is_some_and(|id| other_region.id < id));
                    if better
                        && can_merge_with_region(region, other_region)
                        && can_merge_with_region(other_region, region)
                    {
                        smallest_region_size = other_region.span_count;
                        merge_id = Some(other_region.id);
                    }
                }
            }

            if let Some(merge_id) = merge_id {
                let old_id = regions[region_index].id;

                if merge_regions_into(&mut regions, region_index, merge_id as usize) {
                    // Fix up regions pointing to this region.
                    for region in regions.iter_mut() {
                        if region.id == 0 {
                            continue;
                        }

                        if region.id == old_id {
                            region.id = merge_id;
                        }

                        replace_neighbour(region, old_id, merge_id);
                    }

                    merged = true;
                }
            }
        }

        if !merged {
            break;
        }
    }

    // Compress region ids.
    for region in regions.iter_mut() {
        region.remap = region.id != 0;
    }

    let mut region_id_gen = 0;
    for i in 0..regions.len() {
        if !regions[i].remap {
            continue;
        }
        region_id_gen += 1;

        let old_id = regions[i].id;
        let new_id = region_id_gen;

        for region in regions.iter_mut().skip(i) {
            if region.id == old_id {
                region.id = new_id;
                region.remap = false;
            }
        }
    }
    *max_region_id = region_id_gen + 1;

    // Remap regions.
    for cell in tile.cells.iter() {
        for span in cell.spans.iter() {
            let region = source_regions[span.tile_index];
            if region != 0 {
                source_regions[span.tile_index] = regions[region as usize].id;
            }
        }
    }
}

fn replace_neighbour(region: &mut Region, old_id: u16, new_id: u16) {
    let mut connection_changed = false;
    for connection in region.connections.iter_mut() {
        if *connection == old_id {
            *connection = new_id;
            connection_changed = true;
        }
    }
    for floor in region.floors.iter_mut() {
        if *floor == old_id {
            *floor = new_id;
        }
    }
    if connection_changed {
        remove_adjacent_connection_duplicates(region);
    }
}

fn merge_regions_into(regions: &mut [Region], a: usize, b: usize) -> bool {
    let merged_connections = {
        let region_a = &regions[a];
        let region_b = &regions[b];

        let Some(insert_point_a) = region_a
            .connections
            .iter()
            .position(|i| *i == region_b.id)
        else {
            return false;
        };
        let Some(insert_point_b) = region_b
            .connections
            .iter()
            .position(|i| *i == region_a.id)
        else {
            return false;
        };

        let mut merged_connections =
            Vec::with_capacity(region_a.connections.len() + region_b.connections.len() - 2);
        let size = region_a.connections.len() - 1;
        for i in 0..size {
            merged_connections.push(region_a.connections[(insert_point_a + 1 + i) % size]);
        }
        let size = region_b.connections.len() - 1;
        for i in 0..size {
            merged_connections.push(region_b.connections[(insert_point_b + 1 + i) % size]);
        }

        merged_connections
    };

    let (a_span_count, floors) = {
        let region_a = &mut regions[a];
        region_a.connections.clear();

        let count = region_a.span_count;
        region_a.span_count = 0;

        // The slot keeps its id; the caller's fix-up pass remaps it to the
        // merge target so spans of the absorbed region resolve correctly.
        (count, std::mem::take(&mut region_a.floors))
    };

    {
        let region_b = &mut regions[b];
        region_b.span_count += a_span_count;
        region_b.connections = merged_connections;

        remove_adjacent_connection_duplicates(region_b);

        // add unique floors.
        for floor in floors {
            add_unique_floor_region(region_b, floor);
        }
    }

    true
}

fn remove_adjacent_connection_duplicates(region: &mut Region) {
    if region.connections.len() > 1 {
        let mut i = 0;
        while i < region.connections.len() {
            let next_index = (i + 1) % region.connections.len();
            let current = region.connections[i];
            let next = region.connections[next_index];

            if current == next {
                region.connections.remove(next_index);
            } else {
                i += 1;
            }
        }
    }
}

fn can_merge_with_region(a: &Region, b: &Region) -> bool {
    if a.area != b.area {
        return false;
    }

    // Only a single shared boundary segment.
    let shared = a.connections.iter().filter(|i| **i == b.id).count();
    if shared != 1 {
        return false;
    }

    !a.floors.contains(&b.id)
}

fn walk_region_edge(
    mut cell_index: usize,
    mut span_index: usize,
    mut dir: usize,
    tile: &OpenTile,
    nav_mesh_settings: &NavMeshSettings,
    source_regions: &[u16],
    contour: &mut Vec<u16>,
) {
    let start_direction = dir;
    let start_cell = cell_index;
    let start_span = span_index;

    let span = &tile.cells[cell_index].spans[span_index];
    let mut current_region = 0;
    if let Some(index) = span.neighbours[dir] {
        let other_span = &tile.cells
            [(cell_index as isize + get_cell_offset(nav_mesh_settings, dir)) as usize]
            .spans[index as usize];

        current_region = source_regions[other_span.tile_index];
    }
    contour.push(current_region);

    loop {
        let span = &tile.cells[cell_index].spans[span_index];
        if is_solid_edge(
            nav_mesh_settings,
            tile,
            span,
            cell_index,
            dir,
            source_regions,
        ) {
            let mut r = 0;
            if let Some(index) = span.neighbours[dir] {
                let other_span = &tile.cells
                    [(cell_index as isize + get_cell_offset(nav_mesh_settings, dir)) as usize]
                    .spans[index as usize];

                r = source_regions[other_span.tile_index];
            }
            if r != current_region {
                current_region = r;
                contour.push(r);
            }

            dir = (dir + 1) & 0x3; // Rotate clock-wise.
        } else {
            // Direction is connected.
            if let Some(index) = span.neighbours[dir] {
                span_index = index.into();
            } else {
                return;
            }

            cell_index = (cell_index as isize + get_cell_offset(nav_mesh_settings, dir)) as usize;
            dir = (dir + 3) & 0x3; // Rotate COUNTER clock-wise.
        }

        if start_cell == cell_index && start_span == span_index && start_direction == dir {
            break;
        }
    }

    // Remove adjacent duplicates.
    if contour.len() > 2 {
        let mut i = 0;
        while i < contour.len() {
            let next_index = (i + 1) % contour.len();
            let current = contour[i];
            let next = contour[next_index];

            if current == next {
                contour.remove(next_index);
            } else {
                i += 1;
            }
        }
    }
}

fn is_solid_edge(
    nav_mesh_settings: &NavMeshSettings,
    tile: &OpenTile,
    span: &OpenSpan,
    c_i: usize,
    dir: usize,
    source_region: &[u16],
) -> bool {
    if let Some(index) = span.neighbours[dir] {
        let other_span = &tile.cells
            [(c_i as isize + get_cell_offset(nav_mesh_settings, dir)) as usize]
            .spans[index as usize];

        return source_region[other_span.tile_index] != source_region[span.tile_index];
    }

    true
}

fn add_unique_floor_region(region: &mut Region, region_id: u16) {
    if region.floors.contains(&region_id) {
        return;
    }

    region.floors.push(region_id);
}

#[cfg(test)]
mod tests {
    use bevy::prelude::{Transform, UVec2, Vec3};

    use super::*;
    use crate::conversion::{GeometryCollection, Triangles};
    use crate::heightfields::{
        build_heightfield_tile, build_open_heightfield_tile, calculate_distance_field,
        erode_walkable_area,
    };

    fn quad(offset: Vec3, size: f32, y: f32) -> GeometryCollection {
        GeometryCollection::new(
            Transform::IDENTITY,
            Triangles::TriMesh(
                Box::new([
                    offset + Vec3::new(0.0, y, 0.0),
                    offset + Vec3::new(size, y, 0.0),
                    offset + Vec3::new(size, y, size),
                    offset + Vec3::new(0.0, y, size),
                ]),
                Box::new([[0, 2, 1], [0, 3, 2]]),
            ),
        )
    }

    fn partitioned_tile(
        collections: &[GeometryCollection],
        settings: &crate::NavMeshSettings,
    ) -> OpenTile {
        let tile_coord = UVec2::new(5, 5);
        let voxelized = build_heightfield_tile(tile_coord, collections, settings);
        let mut open_tile = build_open_heightfield_tile(&voxelized, settings);
        erode_walkable_area(&mut open_tile, settings);
        calculate_distance_field(&mut open_tile, settings);
        build_regions(&mut open_tile, settings);
        open_tile
    }

    fn region_ids(tile: &OpenTile) -> Vec<u16> {
        let mut ids: Vec<u16> = tile
            .cells
            .iter()
            .flat_map(|cell| cell.spans.iter())
            .filter(|span| span.region != 0)
            .map(|span| span.region)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    #[test]
    fn single_floor_becomes_one_region() {
        for partition_type in [
            PartitionType::Watershed,
            PartitionType::Monotone,
            PartitionType::Layers,
        ] {
            let settings = crate::NavMeshSettings::from_agent_and_bounds(0.5, 2.0, 50.0, 0.0)
                .with_cell_size(1.0, 0.5)
                .with_walkable_radius(1)
                .with_step_height(1)
                .with_region_area(1, 100)
                .with_partition_type(partition_type);

            let origin = settings.get_tile_origin_with_border(UVec2::new(5, 5));
            let offset = Vec3::new(origin.x, 1.0, origin.y);

            let tile = partitioned_tile(&[quad(offset, 10.0, 0.0)], &settings);

            assert_eq!(
                region_ids(&tile).len(),
                1,
                "{partition_type:?} must produce one region for a flat floor"
            );
        }
    }

    #[test]
    fn separated_floors_get_different_regions() {
        let settings = crate::NavMeshSettings::from_agent_and_bounds(0.5, 2.0, 50.0, 0.0)
            .with_cell_size(1.0, 0.5)
            .with_walkable_radius(1)
            .with_step_height(1)
            .with_region_area(1, 100);

        let origin = settings.get_tile_origin_with_border(UVec2::new(5, 5));
        let offset = Vec3::new(origin.x, 1.0, origin.y);

        // Two quads with a gap between them.
        let tile = partitioned_tile(
            &[
                quad(offset, 8.0, 0.0),
                quad(offset + Vec3::new(14.0, 0.0, 0.0), 8.0, 0.0),
            ],
            &settings,
        );

        assert!(region_ids(&tile).len() >= 2);
    }

    #[test]
    fn regions_never_span_different_areas() {
        let settings = crate::NavMeshSettings::from_agent_and_bounds(0.5, 2.0, 50.0, 0.0)
            .with_cell_size(1.0, 0.5)
            .with_walkable_radius(1)
            .with_step_height(1)
            .with_region_area(1, 1000);

        let tile_coord = UVec2::new(5, 5);
        let origin = settings.get_tile_origin_with_border(tile_coord);
        let offset = Vec3::new(origin.x, 1.0, origin.y);

        let voxelized = build_heightfield_tile(tile_coord, &[quad(offset, 12.0, 0.0)], &settings);
        let mut open_tile = build_open_heightfield_tile(&voxelized, &settings);
        erode_walkable_area(&mut open_tile, &settings);

        // Tag half of the floor as a different area.
        crate::areas::mark_box_area(
            &settings,
            tile_coord,
            offset + Vec3::new(6.0, -2.0, -1.0),
            offset + Vec3::new(13.0, 2.0, 13.0),
            Some(Area(3)),
            &mut open_tile,
        );

        calculate_distance_field(&mut open_tile, &settings);
        build_regions(&mut open_tile, &settings);

        let tile_side = settings.get_tile_side_with_border();
        for (i, cell) in open_tile.cells.iter().enumerate() {
            for span in cell.spans.iter() {
                if span.region == 0 {
                    continue;
                }

                for (dir, neighbour) in span.neighbours.iter().enumerate() {
                    let Some(neighbour) = neighbour else {
                        continue;
                    };

                    let other_span = &open_tile.cells[get_neighbour_index(tile_side, i, dir)]
                        .spans[*neighbour as usize];
                    if other_span.region == span.region {
                        assert_eq!(
                            open_tile.areas[span.tile_index],
                            open_tile.areas[other_span.tile_index],
                            "a region must not span multiple areas"
                        );
                    }
                }
            }
        }
    }
}
