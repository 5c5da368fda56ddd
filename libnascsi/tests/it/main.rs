mod clones;
mod common;
mod volumes;
