//! Input mappings: mouse button masks and the logical-key to X11 keysym
//! table used when synthesizing keyboard traffic.

use hashbrown::HashMap;
use lazy_static::lazy_static;

/// Mouse buttons recognized by the backend, combined into a bitmask.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MouseButton {
    Left = 0x01,
    Middle = 0x02,
    Right = 0x04,
    ScrollUp = 0x08,
    ScrollDown = 0x10,
}

/// Combines pressed buttons into the wire mask.
#[inline]
pub fn button_mask(buttons: &[MouseButton]) -> u32 {
    buttons.iter().fold(0, |mask, b| mask | *b as u32)
}

/// Logical keys. Printable ASCII (32..=126) passes through as `Char`; the
/// named keys map to one or more X11 keysyms below.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum KeyCode {
    Char(char),
    Again,
    AllCandidates,
    Alphanumeric,
    LeftAlt,
    RightAlt,
    Attn,
    AltGraph,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    ArrowUp,
    Backspace,
    CapsLock,
    Cancel,
    Clear,
    Convert,
    Copy,
    CrSel,
    CodeInput,
    Compose,
    LeftControl,
    RightControl,
    ContextMenu,
    Delete,
    End,
    Enter,
    EraseEof,
    Escape,
    Execute,
    ExSel,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
    F13,
    F14,
    F15,
    F16,
    F17,
    F18,
    F19,
    F20,
    F21,
    F22,
    F23,
    F24,
    Find,
    GroupFirst,
    GroupLast,
    GroupNext,
    GroupPrevious,
    FullWidth,
    HalfWidth,
    HangulMode,
    Hankaku,
    HanjaMode,
    Help,
    Hiragana,
    HiraganaKatakana,
    Home,
    Hyper,
    Insert,
    JapaneseHiragana,
    JapaneseKatakana,
    JapaneseRomaji,
    JunjaMode,
    KanaMode,
    KanjiMode,
    Katakana,
    Meta,
    ModeChange,
    NumLock,
    PageDown,
    PageUp,
    Pause,
    Play,
    PreviousCandidate,
    PrintScreen,
    Redo,
    RomanCharacters,
    ScrollLock,
    Select,
    Separator,
    LeftShift,
    RightShift,
    SingleCandidate,
    Super,
    Tab,
    Undo,
    Win,
    Zenkaku,
    ZenkakuHankaku,
}

lazy_static! {
    static ref KEYSYMS: HashMap<KeyCode, &'static [u32]> = {
        use KeyCode::*;
        let mut m: HashMap<KeyCode, &'static [u32]> = HashMap::new();
        m.insert(Again, &[0xFF66]);
        m.insert(AllCandidates, &[0xFF3D]);
        m.insert(Alphanumeric, &[0xFF30]);
        m.insert(LeftAlt, &[0xFFE9]);
        m.insert(RightAlt, &[0xFFE9, 0xFE03]);
        m.insert(Attn, &[0xFD0E]);
        m.insert(AltGraph, &[0xFE03]);
        m.insert(ArrowDown, &[0xFF54]);
        m.insert(ArrowLeft, &[0xFF51]);
        m.insert(ArrowRight, &[0xFF53]);
        m.insert(ArrowUp, &[0xFF52]);
        m.insert(Backspace, &[0xFF08]);
        m.insert(CapsLock, &[0xFFE5]);
        m.insert(Cancel, &[0xFF69]);
        m.insert(Clear, &[0xFF0B]);
        m.insert(Convert, &[0xFF21]);
        m.insert(Copy, &[0xFD15]);
        m.insert(CrSel, &[0xFD1C]);
        m.insert(CodeInput, &[0xFF37]);
        m.insert(Compose, &[0xFF20]);
        m.insert(LeftControl, &[0xFFE3]);
        m.insert(RightControl, &[0xFFE3, 0xFFE4]);
        m.insert(ContextMenu, &[0xFF67]);
        m.insert(Delete, &[0xFFFF]);
        m.insert(End, &[0xFF57]);
        m.insert(Enter, &[0xFF0D]);
        m.insert(EraseEof, &[0xFD06]);
        m.insert(Escape, &[0xFF1B]);
        m.insert(Execute, &[0xFF62]);
        m.insert(ExSel, &[0xFD1D]);
        m.insert(F1, &[0xFFBE]);
        m.insert(F2, &[0xFFBF]);
        m.insert(F3, &[0xFFC0]);
        m.insert(F4, &[0xFFC1]);
        m.insert(F5, &[0xFFC2]);
        m.insert(F6, &[0xFFC3]);
        m.insert(F7, &[0xFFC4]);
        m.insert(F8, &[0xFFC5]);
        m.insert(F9, &[0xFFC6]);
        m.insert(F10, &[0xFFC7]);
        m.insert(F11, &[0xFFC8]);
        m.insert(F12, &[0xFFC9]);
        m.insert(F13, &[0xFFCA]);
        m.insert(F14, &[0xFFCB]);
        m.insert(F15, &[0xFFCC]);
        m.insert(F16, &[0xFFCD]);
        m.insert(F17, &[0xFFCE]);
        m.insert(F18, &[0xFFCF]);
        m.insert(F19, &[0xFFD0]);
        m.insert(F20, &[0xFFD1]);
        m.insert(F21, &[0xFFD2]);
        m.insert(F22, &[0xFFD3]);
        m.insert(F23, &[0xFFD4]);
        m.insert(F24, &[0xFFD5]);
        m.insert(Find, &[0xFF68]);
        m.insert(GroupFirst, &[0xFE0C]);
        m.insert(GroupLast, &[0xFE0E]);
        m.insert(GroupNext, &[0xFE08]);
        m.insert(GroupPrevious, &[0xFE0A]);
        m.insert(FullWidth, &[]);
        m.insert(HalfWidth, &[]);
        m.insert(HangulMode, &[0xFF31]);
        m.insert(Hankaku, &[0xFF29]);
        m.insert(HanjaMode, &[0xFF34]);
        m.insert(Help, &[0xFF6A]);
        m.insert(Hiragana, &[0xFF25]);
        m.insert(HiraganaKatakana, &[0xFF27]);
        m.insert(Home, &[0xFF50]);
        m.insert(Hyper, &[0xFFED, 0xFFED, 0xFFEE]);
        m.insert(Insert, &[0xFF63]);
        m.insert(JapaneseHiragana, &[0xFF25]);
        m.insert(JapaneseKatakana, &[0xFF26]);
        m.insert(JapaneseRomaji, &[0xFF24]);
        m.insert(JunjaMode, &[0xFF38]);
        m.insert(KanaMode, &[0xFF2D]);
        m.insert(KanjiMode, &[0xFF21]);
        m.insert(Katakana, &[0xFF26]);
        m.insert(Meta, &[0xFFE7, 0xFFE7, 0xFFE8]);
        m.insert(ModeChange, &[0xFF7E]);
        m.insert(NumLock, &[0xFF7F]);
        m.insert(PageDown, &[0xFF56]);
        m.insert(PageUp, &[0xFF55]);
        m.insert(Pause, &[0xFF13]);
        m.insert(Play, &[0xFD16]);
        m.insert(PreviousCandidate, &[0xFF3E]);
        m.insert(PrintScreen, &[0xFF61]);
        m.insert(Redo, &[0xFF66]);
        m.insert(RomanCharacters, &[]);
        m.insert(ScrollLock, &[0xFF14]);
        m.insert(Select, &[0xFF60]);
        m.insert(Separator, &[0xFFAC]);
        m.insert(LeftShift, &[0xFFE1]);
        m.insert(RightShift, &[0xFFE1, 0xFFE2]);
        m.insert(SingleCandidate, &[0xFF3C]);
        m.insert(Super, &[0xFFEB, 0xFFEB, 0xFFEC]);
        m.insert(Tab, &[0xFF09]);
        m.insert(Undo, &[0xFF65]);
        m.insert(Win, &[0xFFEB]);
        m.insert(Zenkaku, &[0xFF28]);
        m.insert(ZenkakuHankaku, &[0xFF2A]);
        m
    };
}

/// Resolves a logical key to its ordered keysym sequence. Printable ASCII
/// maps to itself; unmapped keys yield `None`.
pub fn keysyms(key: KeyCode) -> Option<Vec<u32>> {
    if let KeyCode::Char(ch) = key {
        if (' '..='~').contains(&ch) {
            return Some(vec![ch as u32]);
        }
        return None;
    }
    KEYSYMS.get(&key).map(|syms| syms.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_identity() {
        assert_eq!(keysyms(KeyCode::Char('a')), Some(vec![97]));
        assert_eq!(keysyms(KeyCode::Char(' ')), Some(vec![32]));
        assert_eq!(keysyms(KeyCode::Char('~')), Some(vec![126]));
        assert_eq!(keysyms(KeyCode::Char('\u{7f}')), None);
    }

    #[test]
    fn test_modifier_sequences() {
        assert_eq!(keysyms(KeyCode::RightAlt), Some(vec![0xFFE9, 0xFE03]));
        assert_eq!(keysyms(KeyCode::RightShift), Some(vec![0xFFE1, 0xFFE2]));
        assert_eq!(keysyms(KeyCode::Hyper), Some(vec![0xFFED, 0xFFED, 0xFFEE]));
        assert_eq!(keysyms(KeyCode::Enter), Some(vec![0xFF0D]));
    }

    #[test]
    fn test_unmapped_named_keys() {
        assert_eq!(keysyms(KeyCode::FullWidth), Some(vec![]));
    }

    #[test]
    fn test_button_mask() {
        use MouseButton::*;
        assert_eq!(button_mask(&[]), 0);
        assert_eq!(button_mask(&[Left]), 0x01);
        assert_eq!(button_mask(&[Left, Right, ScrollDown]), 0x15);
    }
}
