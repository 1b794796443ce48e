//! NIfTI-1 volume payloads.
//!
//! Only single-file images (`.nii`, optionally gzip compressed) can be
//! stored as one archive member, so header-only files are rejected.

use std::io::{self, Read, Write};

use byteordered::{ByteOrdered, Endianness};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use num_traits::FromPrimitive;

use super::{Codec, CodecError, Decoded};

/// Magic code for NIFTI-1 header files (extention ".hdr[.gz]").
pub const MAGIC_CODE_NI1: &[u8; 4] = b"ni1\0";
/// Magic code for full NIFTI-1 files (extention ".nii[.gz]").
pub const MAGIC_CODE_NIP1: &[u8; 4] = b"n+1\0";

const HEADER_SIZE: usize = 348;
const MIN_VOX_OFFSET: usize = 352;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const EMPTY_EXTENDER: [u8; MIN_VOX_OFFSET - HEADER_SIZE] = [0; MIN_VOX_OFFSET - HEADER_SIZE];

quick_error! {
    /// Errors raised while decoding or encoding a NIfTI-1 payload.
    #[derive(Debug)]
    pub enum NiftiError {
        /// Read an invalid NIfTI-1 file
        InvalidFormat {
            display("Invalid NIfTI-1 file")
        }
        /// The header points to a separate image file
        NoVolumeData {
            display("No volume data available")
        }
        /// The datatype code is not defined by the standard
        UnsupportedDataType(code: i16) {
            display("Unsupported data type code {}", code)
        }
        /// The voxel buffer does not match the header dimensions
        IncorrectVolumeSize(expected: usize, found: usize) {
            display("Volume holds {} bytes, expected {}", found, expected)
        }
        /// I/O Error
        Io(err: io::Error) {
            from()
            source(err)
            display("I/O error: {}", err)
        }
    }
}

/// Data type for representing a NIFTI value type in a volume.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, FromPrimitive)]
pub enum NiftiType {
    /// unsigned char.
    Uint8 = 2,
    /// signed short.
    Int16 = 4,
    /// signed int.
    Int32 = 8,
    /// 32 bit float.
    Float32 = 16,
    /// 64 bit complex = 2 32 bit floats.
    Complex64 = 32,
    /// 64 bit float = double.
    Float64 = 64,
    /// 3 8 bit bytes.
    Rgb24 = 128,
    /// signed char.
    Int8 = 256,
    /// unsigned short.
    Uint16 = 512,
    /// unsigned int.
    Uint32 = 768,
    /// signed long long.
    Int64 = 1024,
    /// unsigned long long.
    Uint64 = 1280,
    /// 128 bit float = long double.
    Float128 = 1536,
    /// 128 bit complex = 2 64 bit floats.
    Complex128 = 1792,
    /// 256 bit complex = 2 128 bit floats
    Complex256 = 2048,
    /// 4 8 bit bytes.
    Rgba32 = 2304,
}

impl NiftiType {
    /// Retrieve the size of an element of this data type, in bytes.
    pub fn size_of(self) -> usize {
        use self::NiftiType::*;
        match self {
            Int8 | Uint8 => 1,
            Int16 | Uint16 => 2,
            Rgb24 => 3,
            Int32 | Uint32 | Float32 | Rgba32 => 4,
            Int64 | Uint64 | Float64 | Complex64 => 8,
            Float128 | Complex128 => 16,
            Complex256 => 32,
        }
    }
}

/// The NIFTI-1 header data type.
/// All fields are public and named after the NIfTI-1 header file.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    /// Header size, must be 348
    pub sizeof_hdr: i32,
    /// Unused in NIFTI-1
    pub data_type: [u8; 10],
    /// Unused in NIFTI-1
    pub db_name: [u8; 18],
    /// Unused in NIFTI-1
    pub extents: i32,
    /// Unused in NIFTI-1
    pub session_error: i16,
    /// Unused in NIFTI-1
    pub regular: u8,
    /// MRI slice ordering
    pub dim_info: u8,
    /// Data array dimensions
    pub dim: [u16; 8],
    /// 1st intent parameter
    pub intent_p1: f32,
    /// 2nd intent parameter
    pub intent_p2: f32,
    /// 3rd intent parameter
    pub intent_p3: f32,
    /// NIFTI_INTENT_* code
    pub intent_code: i16,
    /// Defines the data type!
    pub datatype: i16,
    /// Number of bits per voxel
    pub bitpix: i16,
    /// First slice index
    pub slice_start: i16,
    /// Grid spacings
    pub pixdim: [f32; 8],
    /// Offset into .nii file to reach the volume
    pub vox_offset: f32,
    /// Data scaling: slope
    pub scl_slope: f32,
    /// Data scaling: offset
    pub scl_inter: f32,
    /// Last slice index
    pub slice_end: i16,
    /// Slice timing order
    pub slice_code: u8,
    /// Units of pixdim[1..4]
    pub xyzt_units: u8,
    /// Max display intensity
    pub cal_max: f32,
    /// Min display intensity
    pub cal_min: f32,
    /// Time for 1 slice
    pub slice_duration: f32,
    /// Time axis shift
    pub toffset: f32,
    /// Unused in NIFTI-1
    pub glmax: i32,
    /// Unused in NIFTI-1
    pub glmin: i32,
    /// Any text you like
    pub descrip: [u8; 80],
    /// Auxiliary filename
    pub aux_file: [u8; 24],
    /// NIFTI_XFORM_* code
    pub qform_code: i16,
    /// NIFTI_XFORM_* code
    pub sform_code: i16,
    /// Quaternion parameters b, c, d followed by the x, y, z shifts
    pub quatern: [f32; 6],
    /// Affine transform rows
    pub srow: [[f32; 4]; 3],
    /// 'name' or meaning of data
    pub intent_name: [u8; 16],
    /// Magic code. Must be `b"ni1\0"` or `b"n+1\0"`
    pub magic: [u8; 4],
    /// Original data Endianness
    pub endianness: Endianness,
}

impl Default for NiftiHeader {
    fn default() -> NiftiHeader {
        NiftiHeader {
            sizeof_hdr: HEADER_SIZE as i32,
            data_type: [0; 10],
            db_name: [0; 18],
            extents: 0,
            session_error: 0,
            regular: 0,
            dim_info: 0,
            dim: [1, 0, 0, 0, 0, 0, 0, 0],
            intent_p1: 0.,
            intent_p2: 0.,
            intent_p3: 0.,
            intent_code: 0,
            datatype: 0,
            bitpix: 0,
            slice_start: 0,
            pixdim: [0.; 8],
            vox_offset: MIN_VOX_OFFSET as f32,
            scl_slope: 0.,
            scl_inter: 0.,
            slice_end: 0,
            slice_code: 0,
            xyzt_units: 0,
            cal_max: 0.,
            cal_min: 0.,
            slice_duration: 0.,
            toffset: 0.,
            glmax: 0,
            glmin: 0,
            descrip: [0; 80],
            aux_file: [0; 24],
            qform_code: 0,
            sform_code: 0,
            quatern: [0.; 6],
            srow: [[0.; 4]; 3],
            intent_name: [0; 16],
            magic: *MAGIC_CODE_NIP1,
            endianness: Endianness::Little,
        }
    }
}

impl NiftiHeader {
    /// Read a NIfTI-1 header from the given byte stream. The byte order is
    /// detected from the `sizeof_hdr` field.
    pub fn from_reader<R: Read>(mut input: R) -> Result<NiftiHeader, NiftiError> {
        let mut sizeof_hdr = [0; 4];
        input.read_exact(&mut sizeof_hdr)?;
        let endianness = if i32::from_le_bytes(sizeof_hdr) == HEADER_SIZE as i32 {
            Endianness::Little
        } else if i32::from_be_bytes(sizeof_hdr) == HEADER_SIZE as i32 {
            Endianness::Big
        } else {
            return Err(NiftiError::InvalidFormat);
        };

        let mut h = NiftiHeader {
            endianness,
            ..NiftiHeader::default()
        };
        let mut input = ByteOrdered::runtime(input, endianness);

        input.read_exact(&mut h.data_type)?;
        input.read_exact(&mut h.db_name)?;
        h.extents = input.read_i32()?;
        h.session_error = input.read_i16()?;
        h.regular = input.read_u8()?;
        h.dim_info = input.read_u8()?;
        for v in &mut h.dim {
            *v = input.read_u16()?;
        }
        h.intent_p1 = input.read_f32()?;
        h.intent_p2 = input.read_f32()?;
        h.intent_p3 = input.read_f32()?;
        h.intent_code = input.read_i16()?;
        h.datatype = input.read_i16()?;
        h.bitpix = input.read_i16()?;
        h.slice_start = input.read_i16()?;
        for v in &mut h.pixdim {
            *v = input.read_f32()?;
        }
        h.vox_offset = input.read_f32()?;
        h.scl_slope = input.read_f32()?;
        h.scl_inter = input.read_f32()?;
        h.slice_end = input.read_i16()?;
        h.slice_code = input.read_u8()?;
        h.xyzt_units = input.read_u8()?;
        h.cal_max = input.read_f32()?;
        h.cal_min = input.read_f32()?;
        h.slice_duration = input.read_f32()?;
        h.toffset = input.read_f32()?;
        h.glmax = input.read_i32()?;
        h.glmin = input.read_i32()?;
        input.read_exact(&mut h.descrip)?;
        input.read_exact(&mut h.aux_file)?;
        h.qform_code = input.read_i16()?;
        h.sform_code = input.read_i16()?;
        for v in &mut h.quatern {
            *v = input.read_f32()?;
        }
        for row in &mut h.srow {
            for v in row.iter_mut() {
                *v = input.read_f32()?;
            }
        }
        input.read_exact(&mut h.intent_name)?;
        input.read_exact(&mut h.magic)?;

        if h.dim[0] > 7 || (&h.magic != MAGIC_CODE_NI1 && &h.magic != MAGIC_CODE_NIP1) {
            return Err(NiftiError::InvalidFormat);
        }
        Ok(h)
    }

    /// Write this header in its own byte order.
    pub fn write_to<W: Write>(&self, output: W) -> Result<(), NiftiError> {
        let mut output = ByteOrdered::runtime(output, self.endianness);
        output.write_i32(self.sizeof_hdr)?;
        output.write_all(&self.data_type)?;
        output.write_all(&self.db_name)?;
        output.write_i32(self.extents)?;
        output.write_i16(self.session_error)?;
        output.write_u8(self.regular)?;
        output.write_u8(self.dim_info)?;
        for s in &self.dim {
            output.write_u16(*s)?;
        }
        output.write_f32(self.intent_p1)?;
        output.write_f32(self.intent_p2)?;
        output.write_f32(self.intent_p3)?;
        output.write_i16(self.intent_code)?;
        output.write_i16(self.datatype)?;
        output.write_i16(self.bitpix)?;
        output.write_i16(self.slice_start)?;
        for f in &self.pixdim {
            output.write_f32(*f)?;
        }
        output.write_f32(self.vox_offset)?;
        output.write_f32(self.scl_slope)?;
        output.write_f32(self.scl_inter)?;
        output.write_i16(self.slice_end)?;
        output.write_u8(self.slice_code)?;
        output.write_u8(self.xyzt_units)?;
        output.write_f32(self.cal_max)?;
        output.write_f32(self.cal_min)?;
        output.write_f32(self.slice_duration)?;
        output.write_f32(self.toffset)?;
        output.write_i32(self.glmax)?;
        output.write_i32(self.glmin)?;
        output.write_all(&self.descrip)?;
        output.write_all(&self.aux_file)?;
        output.write_i16(self.qform_code)?;
        output.write_i16(self.sform_code)?;
        for f in &self.quatern {
            output.write_f32(*f)?;
        }
        for f in self.srow.iter().flatten() {
            output.write_f32(*f)?;
        }
        output.write_all(&self.intent_name)?;
        output.write_all(&self.magic)?;
        Ok(())
    }

    /// Get the data type as a validated enum.
    pub fn data_type(&self) -> Result<NiftiType, NiftiError> {
        FromPrimitive::from_i16(self.datatype)
            .ok_or(NiftiError::UnsupportedDataType(self.datatype))
    }

    /// The effective dimensions, without `dim[0]`.
    pub fn dim(&self) -> &[u16] {
        let ndim = usize::from(self.dim[0]).min(7);
        &self.dim[1..=ndim]
    }

    /// The number of bytes taken by the voxel data.
    ///
    /// Fails with `InvalidFormat` when the dimensions do not fit in memory.
    pub fn volume_size(&self) -> Result<usize, NiftiError> {
        let bits = self
            .dim()
            .iter()
            .try_fold(self.bitpix.max(0) as usize, |acc, d| {
                acc.checked_mul(usize::from(*d))
            })
            .ok_or(NiftiError::InvalidFormat)?;
        Ok(bits / 8)
    }
}

/// A single-file NIfTI-1 image held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiImage {
    header: NiftiHeader,
    extensions: Vec<u8>,
    data: Vec<u8>,
}

impl NiftiImage {
    /// Build an image from raw voxel data laid out in the file's byte order.
    pub fn new(dim: &[u16], datatype: NiftiType, data: Vec<u8>) -> Result<Self, NiftiError> {
        if dim.is_empty() || dim.len() > 7 {
            return Err(NiftiError::InvalidFormat);
        }
        let mut header = NiftiHeader {
            datatype: datatype as i16,
            bitpix: (datatype.size_of() * 8) as i16,
            ..NiftiHeader::default()
        };
        header.dim[0] = dim.len() as u16;
        header.dim[1..=dim.len()].copy_from_slice(dim);
        let expected = header.volume_size()?;
        if data.len() != expected {
            return Err(NiftiError::IncorrectVolumeSize(expected, data.len()));
        }
        Ok(NiftiImage {
            header,
            extensions: Vec::new(),
            data,
        })
    }

    /// Decode an image from the bytes of a `.nii` or `.nii.gz` file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NiftiError> {
        if bytes.starts_with(&GZIP_MAGIC) {
            let mut plain = Vec::new();
            let _ = GzDecoder::new(bytes).read_to_end(&mut plain)?;
            Self::from_plain_bytes(&plain)
        } else {
            Self::from_plain_bytes(bytes)
        }
    }

    fn from_plain_bytes(bytes: &[u8]) -> Result<Self, NiftiError> {
        let header = NiftiHeader::from_reader(bytes)?;
        if &header.magic == MAGIC_CODE_NI1 {
            return Err(NiftiError::NoVolumeData);
        }
        let offset = header.vox_offset as usize;
        if offset < MIN_VOX_OFFSET || offset > bytes.len() {
            return Err(NiftiError::InvalidFormat);
        }
        let expected = header.volume_size()?;
        let available = bytes.len() - offset;
        if available < expected {
            return Err(NiftiError::IncorrectVolumeSize(expected, available));
        }
        Ok(NiftiImage {
            extensions: bytes[HEADER_SIZE..offset].to_vec(),
            data: bytes[offset..offset + expected].to_vec(),
            header,
        })
    }

    /// Encode the image as a `.nii` file, gzip compressed if requested.
    pub fn to_bytes(&self, gzip: bool) -> Result<Vec<u8>, NiftiError> {
        let expected = self.header.volume_size()?;
        if self.data.len() != expected {
            return Err(NiftiError::IncorrectVolumeSize(expected, self.data.len()));
        }
        let extensions: &[u8] = if self.extensions.len() < EMPTY_EXTENDER.len() {
            &EMPTY_EXTENDER
        } else {
            &self.extensions
        };
        let header = NiftiHeader {
            vox_offset: (HEADER_SIZE + extensions.len()) as f32,
            magic: *MAGIC_CODE_NIP1,
            ..self.header.clone()
        };

        let mut plain = Vec::with_capacity(HEADER_SIZE + extensions.len() + self.data.len());
        header.write_to(&mut plain)?;
        plain.extend_from_slice(extensions);
        plain.extend_from_slice(&self.data);

        if gzip {
            let mut e = GzEncoder::new(Vec::new(), Compression::default());
            e.write_all(&plain)?;
            Ok(e.finish()?)
        } else {
            Ok(plain)
        }
    }

    /// Obtain a reference to the NIFTI header.
    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    /// Obtain a mutable reference to the NIFTI header.
    pub fn header_mut(&mut self) -> &mut NiftiHeader {
        &mut self.header
    }

    /// Raw extension bytes between the header and the voxel data.
    pub fn extensions(&self) -> &[u8] {
        &self.extensions
    }

    /// The volume's effective dimensions.
    pub fn dim(&self) -> &[u16] {
        self.header.dim()
    }

    /// Get this volume's data type.
    pub fn data_type(&self) -> Result<NiftiType, NiftiError> {
        self.header.data_type()
    }

    /// Raw voxel data, in the byte order given by the header.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the raw voxel data.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Codec for `nifti` volumes, decoding into [`NiftiImage`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NiftiCodec;

impl Codec for NiftiCodec {
    fn decode(&self, _member: &str, bytes: &[u8]) -> Result<Decoded, CodecError> {
        Ok(Box::new(NiftiImage::from_bytes(bytes)?))
    }

    fn encode(&self, member: &str, decoded: &Decoded) -> Option<Result<Vec<u8>, CodecError>> {
        let image = decoded.downcast_ref::<NiftiImage>()?;
        let gzip = member.to_ascii_lowercase().ends_with(".gz");
        Some(image.to_bytes(gzip).map_err(From::from))
    }
}
