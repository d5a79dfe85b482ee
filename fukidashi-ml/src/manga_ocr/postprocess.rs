/// Normalizes decoded text the way manga-ocr reports it: no whitespace,
/// ASCII ellipses, full-width alphanumerics and full-width katakana.
pub fn post_process(text: &str) -> String {
    let clean = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .replace('\u{2026}', "...");
    halfwidth_to_fullwidth(&collapse_dots(&clean))
}

fn is_dot(ch: char) -> bool {
    ch == '.' || ch == '\u{30fb}'
}

/// Runs of two or more `.`/`・` become the same number of `.`; a lone `・` stays.
fn collapse_dots(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut idx = 0;
    while idx < chars.len() {
        let run = chars[idx..].iter().take_while(|ch| is_dot(**ch)).count();
        match run {
            0 | 1 => {
                out.push(chars[idx]);
                idx += 1;
            }
            _ => {
                out.extend(std::iter::repeat_n('.', run));
                idx += run;
            }
        }
    }
    out
}

/// Full-width forms of U+FF61..=U+FF9F, in code point order.
const HALFWIDTH_KANA: &str = "。「」、・ヲァィゥェォャュョッーアイウエオカキクケコサシスセソタチツテトナニヌネノハヒフヘホマミムメモヤユヨラリルレロワン゛゜";

const HALFWIDTH_VOICED_MARK: char = '\u{ff9e}';
const HALFWIDTH_SEMI_VOICED_MARK: char = '\u{ff9f}';

fn halfwidth_to_fullwidth(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        let full = match ch {
            '!'..='~' => char::from_u32(ch as u32 + 0xFEE0).unwrap_or(ch),
            ' ' => '\u{3000}',
            '\u{ff61}'..='\u{ff9f}' => HALFWIDTH_KANA
                .chars()
                .nth((ch as u32 - 0xFF61) as usize)
                .unwrap_or(ch),
            _ => ch,
        };

        // a separate half-width (semi-)voiced mark merges into the kana before it
        let merged = match chars.peek() {
            Some(&HALFWIDTH_VOICED_MARK) if ch != HALFWIDTH_VOICED_MARK => voiced(full),
            Some(&HALFWIDTH_SEMI_VOICED_MARK) if ch != HALFWIDTH_SEMI_VOICED_MARK => {
                semi_voiced(full)
            }
            _ => None,
        };
        match merged {
            Some(merged) => {
                chars.next();
                out.push(merged);
            }
            None => out.push(full),
        }
    }
    out
}

/// `カ` to `ガ`, `ハ` to `バ`, `ウ` to `ヴ`.
fn voiced(kana: char) -> Option<char> {
    let code = kana as u32;
    let voiced = match code {
        0x30AB..=0x30C1 if code % 2 == 1 => code + 1,
        0x30C4 | 0x30C6 | 0x30C8 => code + 1,
        0x30CF..=0x30DB if (code - 0x30CF) % 3 == 0 => code + 1,
        0x30A6 => 0x30F4,
        _ => return None,
    };
    char::from_u32(voiced)
}

/// `ハ` to `パ` and the rest of the row.
fn semi_voiced(kana: char) -> Option<char> {
    let code = kana as u32;
    match code {
        0x30CF..=0x30DB if (code - 0x30CF) % 3 == 0 => char::from_u32(code + 2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{collapse_dots, post_process};

    #[test]
    fn whitespace_is_removed() {
        assert_eq!(post_process("のび 太\nくん"), "のび太くん");
    }

    #[test]
    fn ellipsis_becomes_fullwidth_dots() {
        assert_eq!(post_process("えっ…"), "えっ．．．");
    }

    #[test]
    fn dot_runs_are_collapsed_but_single_middle_dots_kept() {
        assert_eq!(collapse_dots("あ・・・"), "あ...");
        assert_eq!(collapse_dots("あ.・"), "あ..");
        assert_eq!(collapse_dots("ドラ・えもん"), "ドラ・えもん");
        assert_eq!(collapse_dots("。"), "。");
    }

    #[test]
    fn ascii_and_digits_become_fullwidth() {
        assert_eq!(post_process("OK!12"), "ＯＫ！１２");
        assert_eq!(post_process("今日は"), "今日は");
    }

    #[test]
    fn halfwidth_katakana_becomes_fullwidth() {
        assert_eq!(post_process("ｶﾞｯｺｳ｡"), "ガッコウ。");
        assert_eq!(post_process("｢ﾊﾟﾝ､ﾋﾞｰﾙ｣"), "「パン、ビール」");
        assert_eq!(post_process("ｳﾞｧｲｵﾘﾝ"), "ヴァイオリン");
        assert_eq!(post_process("ﾄﾞﾗ･ｴﾓﾝ"), "ドラ・エモン");
    }

    #[test]
    fn voiced_marks_without_a_voiceable_kana_stay_separate() {
        assert_eq!(post_process("ｱﾞ"), "ア゛");
        assert_eq!(post_process("ﾞ"), "゛");
        assert_eq!(post_process("ｶﾟ"), "カ゜");
        assert_eq!(post_process("ﾂﾞﾁﾞ"), "ヅヂ");
    }

    #[test]
    fn empty_text_stays_empty() {
        assert_eq!(post_process(""), "");
        assert_eq!(post_process(" \t"), "");
    }
}
