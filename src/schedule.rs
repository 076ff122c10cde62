use crate::error::ScheduleError;

/// Order in which a stage receives from its predecessor (and, in reverse,
/// sends gradients backward) when the previous stage has a different number
/// of ranks than this one (§4.3).
///
/// Ranks of the previous stage are bucketed by `idx % num_ranks_in_stage`,
/// each bucket walked in increasing order, and buckets are visited in
/// decreasing row order so that a rank processes messages in the order they
/// were sent and the backward send schedule mirrors the forward receive
/// schedule.
#[derive(Debug, Clone)]
pub struct MessagingSchedule {
    /// `rows[r]` is the ascending list of previous-stage rank indices this
    /// stage's row `r` is responsible for.
    rows: Vec<Vec<usize>>,
    fwd_row: i64,
    fwd_col: usize,
    bwd_row: i64,
    bwd_col: usize,
}

impl MessagingSchedule {
    /// Build the schedule for a stage with `num_ranks_in_stage` ranks,
    /// `rank_in_stage` being this process's index within it, receiving from a
    /// previous stage of `num_ranks_in_previous_stage` ranks.
    pub fn new(
        num_ranks_in_stage: usize,
        rank_in_stage: usize,
        num_ranks_in_previous_stage: usize,
    ) -> Result<Self, ScheduleError> {
        if num_ranks_in_stage == 0 {
            return Err(ScheduleError::ZeroRanksInStage);
        }

        let mut rows = Vec::new();
        for i in 0..num_ranks_in_stage {
            let mut row = Vec::new();
            let mut idx = i;
            while idx < num_ranks_in_previous_stage {
                row.push(idx);
                idx += num_ranks_in_stage;
            }
            if !row.is_empty() {
                rows.push(row);
            }
        }

        let mut row = rank_in_stage as i64;
        // Previous stage has fewer workers than this one: ranks beyond the
        // number of populated rows fall back, staying in lockstep for both
        // directions.
        while row >= rows.len() as i64 {
            row -= 1;
        }

        Ok(Self {
            rows,
            fwd_row: row,
            fwd_col: 0,
            bwd_row: row,
            bwd_col: 0,
        })
    }

    /// The previous-stage rank index to receive from (`sending = false`) or
    /// send a gradient to (`sending = true`) at the current cursor position.
    pub fn current_index(&self, sending: bool) -> Result<usize, ScheduleError> {
        if self.rows.is_empty() {
            return Err(ScheduleError::EmptySchedule);
        }
        let (row, col) = if sending {
            (self.bwd_row, self.bwd_col)
        } else {
            (self.fwd_row, self.fwd_col)
        };
        Ok(self.rows[row as usize][col])
    }

    /// Advance the cursor for the given direction, wrapping column-then-row
    /// and cycling the row index back to the last row once it runs below zero.
    pub fn advance(&mut self, sending: bool) -> Result<(), ScheduleError> {
        if self.rows.is_empty() {
            return Err(ScheduleError::EmptySchedule);
        }
        let (row, col) = if sending {
            (&mut self.bwd_row, &mut self.bwd_col)
        } else {
            (&mut self.fwd_row, &mut self.fwd_col)
        };
        *col += 1;
        if *col == self.rows[*row as usize].len() {
            *col = 0;
            *row -= 1;
            if *row == -1 {
                *row = self.rows.len() as i64 - 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_widths_is_identity_pairing() {
        // 3 ranks on both sides: each rank only ever talks to its mirror.
        for rank in 0..3 {
            let sched = MessagingSchedule::new(3, rank, 3).unwrap();
            assert_eq!(sched.current_index(false).unwrap(), rank);
            assert_eq!(sched.current_index(true).unwrap(), rank);
        }
    }

    #[test]
    fn wider_previous_stage_cycles_through_bucket() {
        // previous stage has 5 ranks, this stage has 2: rank 0 handles
        // previous ranks [0, 2, 4], rank 1 handles [1, 3].
        let mut sched = MessagingSchedule::new(2, 0, 5).unwrap();
        let mut seen = vec![sched.current_index(false).unwrap()];
        for _ in 0..2 {
            sched.advance(false).unwrap();
            seen.push(sched.current_index(false).unwrap());
        }
        assert_eq!(seen, vec![0, 2, 4]);
        // one more advance wraps back to the start of the same row (only one row here).
        sched.advance(false).unwrap();
        assert_eq!(sched.current_index(false).unwrap(), 0);
    }

    #[test]
    fn narrower_previous_stage_clamps_row() {
        // previous stage has 1 rank, this stage has 3: ranks 1 and 2 fall
        // back to row 0 (the only populated row).
        let sched0 = MessagingSchedule::new(3, 0, 1).unwrap();
        let sched1 = MessagingSchedule::new(3, 1, 1).unwrap();
        let sched2 = MessagingSchedule::new(3, 2, 1).unwrap();
        assert_eq!(sched0.current_index(false).unwrap(), 0);
        assert_eq!(sched1.current_index(false).unwrap(), 0);
        assert_eq!(sched2.current_index(false).unwrap(), 0);
    }

    #[test]
    fn row_decrements_and_wraps_on_multi_row_advance() {
        // previous stage has 4 ranks, this stage has 2: row 0 = [0, 2], row 1 = [1, 3].
        let mut sched = MessagingSchedule::new(2, 1, 4).unwrap();
        assert_eq!(sched.current_index(false).unwrap(), 1);
        sched.advance(false).unwrap();
        assert_eq!(sched.current_index(false).unwrap(), 3);
        // column exhausted on row 1; row decrements to 0.
        sched.advance(false).unwrap();
        assert_eq!(sched.current_index(false).unwrap(), 0);
        sched.advance(false).unwrap();
        assert_eq!(sched.current_index(false).unwrap(), 2);
        // row 0 exhausted; wraps back up to the last row.
        sched.advance(false).unwrap();
        assert_eq!(sched.current_index(false).unwrap(), 1);
    }

    #[test]
    fn forward_and_backward_cursors_are_independent() {
        let mut sched = MessagingSchedule::new(2, 0, 5).unwrap();
        sched.advance(false).unwrap();
        assert_eq!(sched.current_index(false).unwrap(), 2);
        assert_eq!(sched.current_index(true).unwrap(), 0);
    }

    #[test]
    fn zero_ranks_in_stage_rejected() {
        assert!(matches!(
            MessagingSchedule::new(0, 0, 4),
            Err(ScheduleError::ZeroRanksInStage)
        ));
    }
}
