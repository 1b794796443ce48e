//! An application for reading connectome archive meta-data.

extern crate cff;

use std::env;

fn main() {
    let mut args = env::args().skip(1);
    let filename = args.next().expect("Path to CFF file is required");
    let connectome = cff::open(filename).expect("Failed to read CFF file");
    println!("{:#?}", connectome.manifest());
}
