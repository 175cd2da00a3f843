// SPDX-License-Identifier: MIT
// Numeric primitives shared by the plate reconstruction pipeline.
// Everything here is fixed-size and dependency-free; the heavy lifting
// (pixmaps, caches, threading) lives in the root crate.

pub mod color;
pub mod interp;
pub mod matrix;
pub mod vec;

pub use color::{Rgb, Xyz};
pub use interp::{cubic_interpolate, cubic_interpolate_rgb, modf_floor};
pub use matrix::ColorMatrix;
pub use vec::{IntPoint, Point, Vector};
