use anyhow::{Result, bail};

/// Wire type 0 (varint), 2 (length-delimited) are the only two this crate
/// ever needs to read: MVT layers and glyph entries are both simple
/// `message { ... }` trees built from those two wire types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
	Varint,
	Fixed64,
	LengthDelimited,
	Fixed32,
}

impl WireType {
	fn from_tag(tag: u64) -> Result<Self> {
		Ok(match tag & 0x07 {
			0 => WireType::Varint,
			1 => WireType::Fixed64,
			2 => WireType::LengthDelimited,
			5 => WireType::Fixed32,
			other => bail!("unsupported protobuf wire type {other}"),
		})
	}
}

/// A forward-only cursor over a protobuf message's bytes.
pub struct ProtoReader<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> ProtoReader<'a> {
	pub fn new(buf: &'a [u8]) -> Self {
		ProtoReader { buf, pos: 0 }
	}

	pub fn is_empty(&self) -> bool {
		self.pos >= self.buf.len()
	}

	fn read_byte(&mut self) -> Result<u8> {
		let b = *self.buf.get(self.pos).ok_or_else(|| anyhow::anyhow!("unexpected end of protobuf message"))?;
		self.pos += 1;
		Ok(b)
	}

	pub fn read_varint(&mut self) -> Result<u64> {
		let mut result: u64 = 0;
		let mut shift = 0;
		loop {
			let byte = self.read_byte()?;
			result |= u64::from(byte & 0x7F) << shift;
			if byte & 0x80 == 0 {
				return Ok(result);
			}
			shift += 7;
			if shift >= 64 {
				bail!("protobuf varint too long");
			}
		}
	}

	pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
		if self.pos + len > self.buf.len() {
			bail!("protobuf length-delimited field overruns buffer");
		}
		let slice = &self.buf[self.pos..self.pos + len];
		self.pos += len;
		Ok(slice)
	}

	/// Reads one `(field_number, wire_type)` tag and its payload.
	pub fn next_field(&mut self) -> Result<Option<(u64, Field<'a>)>> {
		if self.is_empty() {
			return Ok(None);
		}
		let tag = self.read_varint()?;
		let field_number = tag >> 3;
		let field = match WireType::from_tag(tag)? {
			WireType::Varint => Field::Varint(self.read_varint()?),
			WireType::Fixed64 => {
				let bytes = self.read_bytes(8)?;
				Field::Fixed64(bytes.try_into().unwrap())
			}
			WireType::LengthDelimited => {
				let len = self.read_varint()? as usize;
				Field::Bytes(self.read_bytes(len)?)
			}
			WireType::Fixed32 => {
				let bytes = self.read_bytes(4)?;
				Field::Fixed32(bytes.try_into().unwrap())
			}
		};
		Ok(Some((field_number, field)))
	}
}

#[derive(Debug, Clone, Copy)]
pub enum Field<'a> {
	Varint(u64),
	Fixed64([u8; 8]),
	Fixed32([u8; 4]),
	Bytes(&'a [u8]),
}

impl<'a> Field<'a> {
	pub fn as_bytes(&self) -> Option<&'a [u8]> {
		match self {
			Field::Bytes(b) => Some(b),
			_ => None,
		}
	}

	pub fn as_varint(&self) -> Option<u64> {
		match self {
			Field::Varint(v) => Some(*v),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn encode_varint(mut v: u64, out: &mut Vec<u8>) {
		loop {
			let mut byte = (v & 0x7F) as u8;
			v >>= 7;
			if v != 0 {
				byte |= 0x80;
			}
			out.push(byte);
			if v == 0 {
				break;
			}
		}
	}

	#[test]
	fn reads_varint_field() {
		let mut buf = Vec::new();
		encode_varint((1 << 3) | 0, &mut buf); // field 1, varint
		encode_varint(150, &mut buf);
		let mut reader = ProtoReader::new(&buf);
		let (num, field) = reader.next_field().unwrap().unwrap();
		assert_eq!(num, 1);
		assert_eq!(field.as_varint(), Some(150));
		assert!(reader.is_empty());
	}

	#[test]
	fn reads_length_delimited_field() {
		let mut buf = Vec::new();
		encode_varint((2 << 3) | 2, &mut buf); // field 2, length-delimited
		encode_varint(5, &mut buf);
		buf.extend_from_slice(b"hello");
		let mut reader = ProtoReader::new(&buf);
		let (num, field) = reader.next_field().unwrap().unwrap();
		assert_eq!(num, 2);
		assert_eq!(field.as_bytes(), Some(b"hello".as_slice()));
	}
}
