//! Option-button arithmetic puzzles.
//!
//! Operands stay small enough for mental arithmetic: 1–20 for addition and
//! subtraction, 1–10 for multiplication. Subtraction swaps operands so the
//! result is never negative. Three distractors are produced by perturbing the
//! answer; a distractor that lands on zero or collides with another option is
//! bumped to `answer + 11` (and up) so the four displayed options are always
//! pairwise distinct.

use rand::Rng;
use rand::seq::SliceRandom;

pub(crate) struct ArithmeticChallenge {
    pub lhs: i64,
    pub rhs: i64,
    pub op: char,
    pub answer: i64,
    /// Four shuffled options, the answer among them exactly once.
    pub options: Vec<i64>,
}

impl ArithmeticChallenge {
    pub fn question(&self) -> String {
        format!("{} {} {} = ?", self.lhs, self.op, self.rhs)
    }
}

pub(crate) fn generate<R: Rng + ?Sized>(rng: &mut R) -> ArithmeticChallenge {
    let (lhs, rhs, op, answer) = match rng.random_range(0..3) {
        0 => {
            let a = rng.random_range(1..=20);
            let b = rng.random_range(1..=20);
            (a, b, '+', a + b)
        }
        1 => {
            let mut a = rng.random_range(1..=20);
            let mut b = rng.random_range(1..=20);
            if a < b {
                std::mem::swap(&mut a, &mut b);
            }
            (a, b, '-', a - b)
        }
        _ => {
            let a = rng.random_range(1..=10);
            let b = rng.random_range(1..=10);
            (a, b, '*', a * b)
        }
    };

    let raw_distractors = [
        answer + rng.random_range(1..=5),
        answer - rng.random_range(1..=5),
        answer + rng.random_range(6..=10),
    ];

    let mut options = vec![answer];
    for distractor in raw_distractors {
        let mut value = distractor;
        if value == 0 || options.contains(&value) {
            value = answer + 11;
            while options.contains(&value) {
                value += 1;
            }
        }
        options.push(value);
    }
    options.shuffle(rng);

    ArithmeticChallenge {
        lhs,
        rhs,
        op,
        answer,
        options,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_are_pairwise_distinct_and_contain_the_answer_once() {
        let mut rng = rand::rng();
        for _ in 0..500 {
            let challenge = generate(&mut rng);
            assert_eq!(challenge.options.len(), 4);

            let hits = challenge
                .options
                .iter()
                .filter(|&&o| o == challenge.answer)
                .count();
            assert_eq!(hits, 1, "answer must appear exactly once");

            for i in 0..4 {
                for j in (i + 1)..4 {
                    assert_ne!(
                        challenge.options[i], challenge.options[j],
                        "duplicate option in {:?}",
                        challenge.options
                    );
                }
            }
        }
    }

    #[test]
    fn zero_never_appears_unless_it_is_the_answer() {
        let mut rng = rand::rng();
        for _ in 0..500 {
            let challenge = generate(&mut rng);
            if challenge.answer != 0 {
                assert!(!challenge.options.contains(&0), "{:?}", challenge.options);
            }
        }
    }

    #[test]
    fn subtraction_never_goes_negative() {
        let mut rng = rand::rng();
        for _ in 0..500 {
            let challenge = generate(&mut rng);
            assert!(challenge.answer >= 0);
            if challenge.op == '-' {
                assert!(challenge.lhs >= challenge.rhs);
            }
        }
    }

    #[test]
    fn multiplication_keeps_operands_small() {
        let mut rng = rand::rng();
        for _ in 0..500 {
            let challenge = generate(&mut rng);
            if challenge.op == '*' {
                assert!((1..=10).contains(&challenge.lhs));
                assert!((1..=10).contains(&challenge.rhs));
            }
        }
    }

    #[test]
    fn question_renders_the_operands() {
        let mut rng = rand::rng();
        let challenge = generate(&mut rng);
        let question = challenge.question();
        assert!(question.contains(&challenge.lhs.to_string()));
        assert!(question.ends_with("= ?"));
    }
}
