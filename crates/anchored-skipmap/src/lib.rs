#![cfg_attr(test, allow(unused_crate_dependencies, reason = "`oorandom` is only used in integration tests"))]

mod map;
mod node;
mod node_heights;
mod ranking;


pub use self::{
    map::{OrdSkipMap, SkipMap},
    ranking::{HashRanking, OrdRanking, Ranking},
};
