//! Linear scan register allocation (Wimmer/Mössenböck variant).
//!
//! Intervals are partitioned into unhandled (virtual, sorted by
//! start), active, inactive and handled. Fixed intervals enter the
//! scan as inactive and can never be split or spilled; they block
//! their register wherever they intersect the current interval.

use super::{IntervalId, LGen, Location, UseKind, LIR_REGISTER_COUNT};

impl LGen<'_> {
    fn sort_by_start(&self, list: &mut Vec<IntervalId>) {
        list.sort_by_key(|&i| self.intervals[i].start());
    }

    fn insert_sorted(&self, list: &mut Vec<IntervalId>, interval: IntervalId) {
        let start = self.intervals[interval].start();
        let pos = list.partition_point(|&i| self.intervals[i].start() <= start);
        list.insert(pos, interval);
    }

    /// Move expired intervals out of active/inactive and swap the two
    /// lists' members according to whether they cover `pos`.
    fn shuffle_intervals(
        &self,
        active: &mut Vec<IntervalId>,
        inactive: &mut Vec<IntervalId>,
        mut handled: Option<&mut Vec<IntervalId>>,
        pos: i32,
    ) {
        let mut new_active = Vec::with_capacity(active.len());
        for &interval in active.iter() {
            if self.intervals[interval].end() < pos {
                if let Some(handled) = handled.as_mut() {
                    handled.push(interval);
                }
            } else if !self.covers(interval, pos) {
                inactive.push(interval);
            } else {
                new_active.push(interval);
            }
        }
        *active = new_active;

        let mut new_inactive = Vec::with_capacity(inactive.len());
        for &interval in inactive.iter() {
            if self.intervals[interval].end() < pos {
                if let Some(handled) = handled.as_mut() {
                    handled.push(interval);
                }
            } else if self.covers(interval, pos) {
                active.push(interval);
            } else {
                new_inactive.push(interval);
            }
        }
        *inactive = new_inactive;
    }

    // --- 6. Walk intervals ---

    pub(super) fn walk_intervals(&mut self) {
        // Populate and sort the unhandled list.
        for id in 0..self.intervals.len() {
            if self.intervals[id].ranges.is_empty() {
                continue;
            }
            if self.intervals[id].fixed {
                self.inactive.push(id);
            } else if self.intervals[id].location == Location::Virtual {
                self.unhandled.push(id);
            }
        }
        let mut unhandled = std::mem::take(&mut self.unhandled);
        let mut inactive = std::mem::take(&mut self.inactive);
        self.sort_by_start(&mut unhandled);
        self.sort_by_start(&mut inactive);
        self.unhandled = unhandled;
        self.inactive = inactive;

        while !self.unhandled.is_empty() {
            let current = self.unhandled.remove(0);
            let pos = self.intervals[current].start();

            let mut active = std::mem::take(&mut self.active);
            let mut inactive = std::mem::take(&mut self.inactive);
            self.shuffle_intervals(&mut active, &mut inactive, None, pos);
            self.active = active;
            self.inactive = inactive;

            self.try_allocate_free_reg(current);

            if !self.intervals[current].is_register() {
                // Spill something and allocate the just-freed
                // register.
                self.allocate_blocked_reg(current);
            }

            debug_assert!(
                self.intervals[current].is_register() || self.intervals[current].is_stackslot()
            );
            if self.intervals[current].is_register() {
                self.active.push(current);
            }
        }
    }

    fn try_allocate_free_reg(&mut self, current: IntervalId) {
        let mut free_pos = [i32::MAX; LIR_REGISTER_COUNT];

        // Registers used by active intervals are not free at all.
        for &active in &self.active {
            let index = self.intervals[active]
                .register_index()
                .expect("active interval has a register");
            free_pos[index] = 0;
        }

        // Inactive intervals limit availability only where they
        // intersect the current interval.
        for &inactive in &self.inactive {
            let index = self.intervals[inactive]
                .register_index()
                .expect("inactive interval has a register");
            if let Some(pos) = self.find_intersection(current, inactive) {
                if free_pos[index] > pos {
                    free_pos[index] = pos;
                }
            }
        }

        // Pick the register that stays free longest.
        let mut max = -1;
        let mut max_reg = 0;
        for (i, &pos) in free_pos.iter().enumerate() {
            if pos > max {
                max = pos;
                max_reg = i;
            }
        }

        // All registers are occupied - failure
        if max - 2 <= self.intervals[current].start() {
            return;
        }

        if max <= self.intervals[current].end() {
            // A split before `max` is needed
            let pos = if max % 2 == 0 { max - 1 } else { max - 2 };
            self.split(current, pos);
        }

        self.intervals[current].location = Location::Register(max_reg);
    }

    fn allocate_blocked_reg(&mut self, current: IntervalId) {
        let mut use_pos = [i32::MAX; LIR_REGISTER_COUNT];
        let mut block_pos = [i32::MAX; LIR_REGISTER_COUNT];
        let current_start = self.intervals[current].start();

        for &active in &self.active {
            let index = self.intervals[active].register_index().unwrap();
            if self.intervals[active].fixed {
                // Fixed intervals block their register outright.
                block_pos[index] = 0;
                use_pos[index] = 0;
            } else if let Some(u) = self.use_after(active, current_start, None) {
                let pos = self.instrs[self.uses[u].instr].id;
                if use_pos[index] > pos {
                    use_pos[index] = pos;
                }
            }
        }

        for &inactive in &self.inactive {
            let index = self.intervals[inactive].register_index().unwrap();
            let intersection = match self.find_intersection(current, inactive) {
                Some(p) => p,
                None => continue,
            };
            if self.intervals[inactive].fixed {
                if block_pos[index] > intersection {
                    block_pos[index] = intersection;
                }
                if use_pos[index] > intersection {
                    use_pos[index] = intersection;
                }
            } else if let Some(u) = self.use_after(inactive, current_start, None) {
                let pos = self.instrs[self.uses[u].instr].id;
                if use_pos[index] > pos {
                    use_pos[index] = pos;
                }
            }
        }

        let mut use_max = -1;
        let mut use_reg = 0;
        for (i, &pos) in use_pos.iter().enumerate() {
            if pos > use_max {
                use_max = pos;
                use_reg = i;
            }
        }

        let first_use = self.use_after(current, current_start, None);
        let first_use_id = first_use.map(|u| self.instrs[self.uses[u].instr].id);

        if first_use_id.is_none()
            || use_max < first_use_id.unwrap()
            || block_pos[use_reg] - 1 <= current_start
        {
            // Current is cheaper to spill than any occupant; split it
            // before its first required-register use.
            self.spill(current);

            if let Some(reg_use) = self.use_after(current, current_start, Some(UseKind::Register)) {
                let id = self.instrs[self.uses[reg_use].instr].id;
                if id > current_start {
                    self.split(current, id - 1);
                }
            }
        } else {
            // Intervals using the register get spilled instead.
            self.intervals[current].location = Location::Register(use_reg);

            if block_pos[use_reg] <= self.intervals[current].end() {
                self.split(current, block_pos[use_reg] - 1);
            }

            // Split and spill every intersecting occupant.
            for list_index in 0..2 {
                let list = if list_index == 0 {
                    std::mem::take(&mut self.active)
                } else {
                    std::mem::take(&mut self.inactive)
                };
                let mut kept = Vec::with_capacity(list.len());

                for interval in list {
                    // Fixed intervals can't be split
                    if self.intervals[interval].fixed
                        || self.intervals[interval].register_index() != Some(use_reg)
                    {
                        kept.push(interval);
                        continue;
                    }
                    let intersection = match self.find_intersection(current, interval) {
                        Some(p) => p,
                        None => {
                            kept.push(interval);
                            continue;
                        }
                    };
                    let pos = if intersection % 2 == 0 {
                        intersection - 1
                    } else {
                        intersection - 2
                    };

                    // If the occupant was needed in a register before
                    // the current interval starts, split it and let
                    // the tail get handled later.
                    let reg_use = self.use_after(interval, 0, Some(UseKind::Register));
                    if let Some(u) = reg_use {
                        if self.instrs[self.uses[u].instr].id <= current_start {
                            let split_at = if current_start % 2 == 0 {
                                current_start - 1
                            } else {
                                current_start - 2
                            };
                            if split_at > self.intervals[interval].start() {
                                self.split(interval, split_at);
                            }
                            kept.push(interval);
                            continue;
                        }
                    }

                    if pos > self.intervals[interval].start() {
                        self.split(interval, pos);
                    }
                    self.spill(interval);
                    // Dropped from the list.
                }

                if list_index == 0 {
                    self.active = kept;
                } else {
                    self.inactive = kept;
                }
            }
        }
    }

    /// Split `interval` at `pos`, producing a child carrying the uses
    /// and ranges at or after the position.
    pub(crate) fn split(&mut self, interval: IntervalId, pos: i32) -> IntervalId {
        debug_assert!(!self.intervals[interval].fixed);
        debug_assert!(
            pos > self.intervals[interval].start() && pos < self.intervals[interval].end()
        );

        let child = self.create_virtual();

        // Move uses from parent to child; the list is sorted, so take
        // from the tail.
        while let Some(&last) = self.intervals[interval].uses.last() {
            if self.instrs[self.uses[last].instr].id < pos {
                break;
            }
            self.intervals[interval].uses.pop();
            self.uses[last].interval = child;
            self.intervals[child].uses.insert(0, last);
        }

        // Move ranges; the one containing `pos` is split in two.
        while let Some(&last) = self.intervals[interval].ranges.last() {
            if last.end <= pos {
                break;
            }
            let mut range = self.intervals[interval].ranges.pop().unwrap();
            if range.start < pos {
                self.intervals[interval].ranges.push(super::LRange {
                    start: range.start,
                    end: pos,
                });
                range.start = pos;
            }
            self.intervals[child].ranges.insert(0, range);
        }

        let parent = self.intervals[interval].split_parent.unwrap_or(interval);
        self.intervals[child].split_parent = Some(parent);
        self.intervals[parent].split_children.insert(0, child);

        let mut unhandled = std::mem::take(&mut self.unhandled);
        self.insert_sorted(&mut unhandled, child);
        self.unhandled = unhandled;

        debug_assert!(self.intervals[interval].end() <= pos);
        debug_assert!(self.intervals[child].start() >= pos);

        // If the parent ends on a block edge the move is inserted
        // when resolving data flow.
        if self.is_block_start(self.intervals[interval].end()) {
            return child;
        }

        let gap = self.get_gap(pos);
        self.instrs[gap].gap_pairs.push((interval, child));

        child
    }

    // --- 8. Allocate spills ---

    pub(super) fn allocate_spills(&mut self) {
        let mut unhandled = std::mem::take(&mut self.unhandled_spills);
        self.sort_by_start(&mut unhandled);

        let mut active: Vec<IntervalId> = Vec::new();
        let mut inactive: Vec<IntervalId> = Vec::new();
        let mut free: Vec<IntervalId> = Vec::new();

        while !unhandled.is_empty() {
            let current = unhandled.remove(0);
            let pos = self.intervals[current].start();

            self.shuffle_intervals(&mut active, &mut inactive, Some(&mut free), pos);

            // Reuse a freed spill slot when its previous occupants
            // are really gone.
            let mut assigned = false;
            while let Some(candidate) = free.pop() {
                let index = self.intervals[candidate].spill_index();
                let conflict = active
                    .iter()
                    .any(|&a| self.intervals[a].spill_index() == index)
                    || inactive.iter().any(|&i| {
                        self.intervals[i].spill_index() == index
                            && self.find_intersection(i, current).is_some()
                    });
                if conflict {
                    continue;
                }
                self.intervals[current].location = Location::Spill(index);
                active.push(current);
                assigned = true;
                break;
            }
            if assigned {
                continue;
            }

            // Any slot index below the high-water mark that nothing
            // live occupies can be reused too.
            let mut blocked: Vec<i32> = Vec::new();
            let mut max_index = 0;
            for &a in &active {
                if let Some(index) = self.intervals[a].spill_index() {
                    blocked.push(index);
                    max_index = max_index.max(index);
                }
            }
            for &i in &inactive {
                if self.find_intersection(i, current).is_some() {
                    if let Some(index) = self.intervals[i].spill_index() {
                        blocked.push(index);
                        max_index = max_index.max(index);
                    }
                }
            }

            let mut found = None;
            for candidate in 0..max_index {
                if !blocked.contains(&candidate) {
                    found = Some(candidate);
                    break;
                }
            }

            let index = match found {
                Some(i) => i,
                None => {
                    let i = self.spill_index;
                    self.spill_index += 1;
                    i
                }
            };
            self.intervals[current].location = Location::Spill(Some(index));
            active.push(current);
        }
    }
}
