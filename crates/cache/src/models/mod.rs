mod result;

pub(crate) use self::result::{CandidateRow, ResultRow};
