//! Catalog keys, name ordering and the catalog tree kind.

use std::cmp::Ordering;

use pfs_ondisk::hfsplus::{
    HFS_KEY_COMPARE_BINARY, HfsCatalogKey, HfsCatalogRecord, HfsHeaderRecord,
};
use pfs_types::ParseError;
use serde::{Deserialize, Serialize};

use crate::format::HfsTreeKind;

/// How catalog node names are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameOrder {
    /// Raw UTF-16 code units (HFSX with `kHFSBinaryCompare`).
    Binary,
    /// Case-insensitive, ignoring the code points HFS+ treats as
    /// transparent.
    CaseFolding,
}

impl NameOrder {
    /// Ordering declared by the catalog header. Only HFSX volumes may ask
    /// for binary comparison.
    #[must_use]
    pub fn from_header(header: &HfsHeaderRecord, is_hfsx: bool) -> Self {
        if is_hfsx && header.key_compare_type == HFS_KEY_COMPARE_BINARY {
            Self::Binary
        } else {
            Self::CaseFolding
        }
    }

    #[must_use]
    pub fn compare_names(self, a: &[u16], b: &[u16]) -> Ordering {
        match self {
            Self::Binary => a.cmp(b),
            Self::CaseFolding => folded(a).cmp(folded(b)),
        }
    }
}

/// One run of the case-folding table: units `first..=last`, every `step`
/// units, map to `to + (unit - first)`. A `to` of zero marks the run as
/// ignorable.
struct Fold {
    first: u16,
    last: u16,
    to: u16,
    step: u16,
}

const fn fold(first: u16, last: u16, to: u16, step: u16) -> Fold {
    Fold {
        first,
        last,
        to,
        step,
    }
}

const fn one(from: u16, to: u16) -> Fold {
    fold(from, from, to, 1)
}

/// TN1150 fast-compare folding. Only characters without a canonical
/// decomposition fold, since names are stored decomposed. NUL sorts after
/// every other unit.
const FOLDS: &[Fold] = &[
    one(0x0000, 0xFFFF),
    fold(0x0041, 0x005A, 0x0061, 1),
    one(0x00C6, 0x00E6),
    one(0x00D0, 0x00F0),
    one(0x00D8, 0x00F8),
    one(0x00DE, 0x00FE),
    one(0x0110, 0x0111),
    one(0x0126, 0x0127),
    one(0x0132, 0x0133),
    one(0x013F, 0x0140),
    one(0x0141, 0x0142),
    one(0x014A, 0x014B),
    one(0x0152, 0x0153),
    one(0x0166, 0x0167),
    one(0x0181, 0x0253),
    one(0x0182, 0x0183),
    one(0x0184, 0x0185),
    one(0x0186, 0x0254),
    one(0x0187, 0x0188),
    one(0x0189, 0x0256),
    one(0x018A, 0x0257),
    one(0x018B, 0x018C),
    one(0x018E, 0x01DD),
    one(0x018F, 0x0259),
    one(0x0190, 0x025B),
    one(0x0191, 0x0192),
    one(0x0193, 0x0260),
    one(0x0194, 0x0263),
    one(0x0196, 0x0269),
    one(0x0197, 0x0268),
    one(0x0198, 0x0199),
    one(0x019C, 0x026F),
    one(0x019D, 0x0272),
    one(0x019F, 0x0275),
    one(0x01A2, 0x01A3),
    one(0x01A4, 0x01A5),
    one(0x01A7, 0x01A8),
    one(0x01A9, 0x0283),
    one(0x01AC, 0x01AD),
    one(0x01AE, 0x0288),
    one(0x01B1, 0x028A),
    one(0x01B2, 0x028B),
    one(0x01B3, 0x01B4),
    one(0x01B5, 0x01B6),
    one(0x01B7, 0x0292),
    one(0x01B8, 0x01B9),
    one(0x01BC, 0x01BD),
    one(0x01C4, 0x01C6),
    one(0x01C5, 0x01C6),
    one(0x01C7, 0x01C9),
    one(0x01C8, 0x01C9),
    one(0x01CA, 0x01CC),
    one(0x01CB, 0x01CC),
    one(0x01E4, 0x01E5),
    one(0x01F1, 0x01F3),
    one(0x01F2, 0x01F3),
    fold(0x0391, 0x03A1, 0x03B1, 1),
    fold(0x03A3, 0x03A9, 0x03C3, 1),
    fold(0x03E2, 0x03EE, 0x03E3, 2),
    one(0x0402, 0x0452),
    fold(0x0404, 0x0406, 0x0454, 1),
    fold(0x0408, 0x040B, 0x0458, 1),
    one(0x040F, 0x045F),
    fold(0x0410, 0x0418, 0x0430, 1),
    fold(0x041A, 0x042F, 0x043A, 1),
    fold(0x0460, 0x0474, 0x0461, 2),
    fold(0x0478, 0x0480, 0x0479, 2),
    fold(0x0490, 0x04BE, 0x0491, 2),
    one(0x04C3, 0x04C4),
    one(0x04C7, 0x04C8),
    one(0x04CB, 0x04CC),
    fold(0x0531, 0x0556, 0x0561, 1),
    fold(0x10A0, 0x10C5, 0x10D0, 1),
    fold(0x200C, 0x200F, 0, 1),
    fold(0x202A, 0x202E, 0, 1),
    fold(0x206A, 0x206F, 0, 1),
    fold(0x2160, 0x216F, 0x2170, 1),
    one(0xFEFF, 0),
    fold(0xFF21, 0xFF3A, 0xFF41, 1),
];

/// High bytes that have a page in `FOLD_PAGES`, in page order.
const PAGE_HIGH: [u8; 10] = [0x00, 0x01, 0x03, 0x04, 0x05, 0x10, 0x20, 0x21, 0xFE, 0xFF];

/// High byte to 1-based page number; 0 means units fold to themselves.
#[allow(clippy::cast_possible_truncation)]
const fn fold_index() -> [u8; 256] {
    let mut index = [0_u8; 256];
    let mut page = 0;
    while page < PAGE_HIGH.len() {
        index[PAGE_HIGH[page] as usize] = page as u8 + 1;
        page += 1;
    }
    index
}

#[allow(clippy::cast_possible_truncation)]
const fn fold_pages() -> [[u16; 256]; PAGE_HIGH.len()] {
    let index = fold_index();
    let mut pages = [[0_u16; 256]; PAGE_HIGH.len()];
    let mut page = 0;
    while page < PAGE_HIGH.len() {
        let mut low = 0;
        while low < 256 {
            pages[page][low] = ((PAGE_HIGH[page] as u16) << 8) | low as u16;
            low += 1;
        }
        page += 1;
    }
    let mut rule = 0;
    while rule < FOLDS.len() {
        let run = &FOLDS[rule];
        let page = index[(run.first >> 8) as usize] as usize - 1;
        let mut unit = run.first;
        while unit <= run.last {
            pages[page][(unit & 0xFF) as usize] = if run.to == 0 {
                0
            } else {
                run.to + (unit - run.first)
            };
            unit += run.step;
        }
        rule += 1;
    }
    pages
}

static FOLD_INDEX: [u8; 256] = fold_index();
static FOLD_PAGES: [[u16; 256]; PAGE_HIGH.len()] = fold_pages();

/// Folded form of `unit`; 0 when the unit is ignored in comparisons.
fn fold_unit(unit: u16) -> u16 {
    match FOLD_INDEX[usize::from(unit >> 8)] {
        0 => unit,
        page => FOLD_PAGES[usize::from(page - 1)][usize::from(unit & 0xFF)],
    }
}

fn folded(name: &[u16]) -> impl Iterator<Item = u16> + '_ {
    name.iter().map(|unit| fold_unit(*unit)).filter(|unit| *unit != 0)
}

/// Catalog file codec. Keys are `(parent id, name)`; the prefix of a key
/// is its parent id, so a prefix scan lists one folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogKind {
    pub order: NameOrder,
}

impl HfsTreeKind for CatalogKind {
    type Key = HfsCatalogKey;
    type Record = HfsCatalogRecord;

    const NAME: &'static str = "hfsplus-catalog";
    // 8-byte key with an empty name, 10-byte thread record.
    const MIN_LEAF_RECORD: usize = 18;
    const MIN_INDEX_KEY: usize = 8;

    fn compare(&self, a: &HfsCatalogKey, b: &HfsCatalogKey) -> Ordering {
        a.parent_id
            .cmp(&b.parent_id)
            .then_with(|| self.order.compare_names(&a.name, &b.name))
    }

    fn parse_key(&self, record: &[u8]) -> Result<(HfsCatalogKey, usize), ParseError> {
        HfsCatalogKey::parse(record)
    }

    fn parse_record(&self, data: &[u8]) -> Result<HfsCatalogRecord, ParseError> {
        HfsCatalogRecord::parse(data)
    }

    fn matches_prefix(&self, candidate: &HfsCatalogKey, prefix: &HfsCatalogKey) -> bool {
        candidate.parent_id == prefix.parent_id
    }

    fn prefix_start(&self, prefix: &HfsCatalogKey) -> HfsCatalogKey {
        HfsCatalogKey {
            parent_id: prefix.parent_id,
            name: Vec::new(),
        }
    }
}
