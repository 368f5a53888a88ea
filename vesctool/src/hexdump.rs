const WIDTH: usize = 0x10;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Line<'a> {
    address: u32,
    data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DedupLine<'a> {
    Data(Line<'a>),
    Duplicate,
}

pub fn printable(chr: u8) -> Option<char> {
    if (0x20..0x7f).contains(&chr) {
        Some(chr as char)
    } else {
        None
    }
}

impl<'a> std::fmt::Display for Line<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:08x}", self.address)?;

        if self.data.is_empty() {
            return Ok(());
        }

        for i in 0..WIDTH {
            if i % 8 == 0 {
                write!(f, " ")?;
            }
            match self.data.get(i) {
                Some(b) => write!(f, " {:02x}", b)?,
                None => write!(f, "   ")?,
            }
        }

        write!(f, "  |")?;
        for b in self.data {
            write!(f, "{}", printable(*b).unwrap_or('.'))?;
        }
        write!(f, "|")
    }
}

impl<'a> std::fmt::Display for DedupLine<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Data(line) => line.fmt(f),
            Self::Duplicate => write!(f, "*"),
        }
    }
}

/// Lines of a dump, ending with a bare address one past the data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DedupLineIter<'a> {
    data: &'a [u8],
    base: u32,
    next: usize,
    done: bool,
    last: Option<&'a [u8]>,
    in_duplicate: bool,
}

impl<'a> DedupLineIter<'a> {
    pub fn new(base: u32, data: &'a [u8]) -> Self {
        Self {
            data,
            base,
            next: 0,
            done: false,
            last: None,
            in_duplicate: false,
        }
    }

    fn address(&self, offset: usize) -> u32 {
        self.base.wrapping_add(offset as u32)
    }
}

impl<'a> Iterator for DedupLineIter<'a> {
    type Item = DedupLine<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.data.len() {
            let start = self.next;
            let end = (start + WIDTH).min(self.data.len());
            let part = &self.data[start..end];
            self.next = end;

            if self.last == Some(part) {
                if !self.in_duplicate {
                    self.in_duplicate = true;
                    return Some(DedupLine::Duplicate);
                }
            } else {
                self.last = Some(part);
                self.in_duplicate = false;
                return Some(DedupLine::Data(Line {
                    address: self.address(start),
                    data: part,
                }));
            }
        }

        if self.done {
            None
        } else {
            self.done = true;
            Some(DedupLine::Data(Line {
                address: self.address(self.data.len()),
                data: &[],
            }))
        }
    }
}

pub fn hexdump_iter(base: u32, data: &[u8]) -> DedupLineIter {
    DedupLineIter::new(base, data)
}

pub fn hexdump_prefix(prefix: &str, data: &[u8]) {
    for line in hexdump_iter(0, data) {
        println!("{}{}", prefix, line);
    }
}

pub fn ehexdump_prefix(prefix: &str, base: u32, data: &[u8]) {
    for line in hexdump_iter(base, data) {
        eprintln!("{}{}", prefix, line);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn lines(base: u32, data: &[u8]) -> Vec<String> {
        hexdump_iter(base, data).map(|l| l.to_string()).collect()
    }

    #[test]
    fn short() {
        let first = format!("00000000  41 42 00{}|AB.|", " ".repeat(42));
        assert_eq!(lines(0, b"AB\x00"), vec![first, "00000003".to_owned()]);
    }

    #[test]
    fn duplicates_collapse() {
        let out = lines(0x0800_0000, &[0xff; 64]);
        assert_eq!(out.len(), 3);
        assert!(out[0].starts_with("08000000  ff ff"));
        assert_eq!(out[1], "*");
        assert_eq!(out[2], "08000040");
    }

    #[test]
    fn empty() {
        assert_eq!(lines(0, b""), vec!["00000000"]);
    }
}
