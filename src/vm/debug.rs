//! Debug information for mapping instructions to source lines.

/// A line table entry: instructions from `pc` onward belong to `line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// Instruction index
    pub pc: u32,
    /// Line number (1-based)
    pub line: u32,
}

/// Sparse pc → line mapping, ordered by `pc`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTable {
    pub entries: Vec<LineEntry>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record that the instruction at `pc` came from `line`. Consecutive
    /// instructions on one line share a single entry.
    pub fn add(&mut self, pc: usize, line: u32) {
        if self.entries.last().is_some_and(|e| e.line == line) {
            return;
        }
        self.entries.push(LineEntry {
            pc: pc as u32,
            line,
        });
    }

    /// Line of the entry with the largest pc <= `pc`.
    pub fn find_line(&self, pc: usize) -> Option<u32> {
        let pc = pc as u32;
        let idx = self.entries.partition_point(|e| e.pc <= pc);
        idx.checked_sub(1).map(|i| self.entries[i].line)
    }

    /// Whether entries are strictly increasing and within `code_len`.
    pub fn is_well_formed(&self, code_len: usize) -> bool {
        self.entries.windows(2).all(|w| w[0].pc < w[1].pc)
            && self.entries.iter().all(|e| (e.pc as usize) < code_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_line() {
        let mut table = LineTable::new();
        table.add(0, 10);
        table.add(1, 10);
        table.add(3, 12);

        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.find_line(0), Some(10));
        assert_eq!(table.find_line(2), Some(10));
        assert_eq!(table.find_line(3), Some(12));
        assert_eq!(table.find_line(99), Some(12));
    }

    #[test]
    fn test_empty_table() {
        assert_eq!(LineTable::new().find_line(0), None);
    }

    #[test]
    fn test_well_formed() {
        let mut table = LineTable::new();
        table.add(0, 1);
        table.add(2, 2);
        assert!(table.is_well_formed(3));
        assert!(!table.is_well_formed(2));
    }
}
